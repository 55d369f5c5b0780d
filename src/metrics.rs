//! The engine's metrics contract (spec §6). Names are part of the external
//! contract and must not change independently of the spec.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    Histogram, HistogramVec, IntCounter, IntCounterVec,
};

pub static S3_FILES_WRITTEN: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "recording_s3_files_written",
        "Number of buffer files flushed to the object store, labeled by flush reason",
        &["flush_reason"]
    )
    .expect("recording_s3_files_written metric registration")
});

pub static S3_WRITE_ERRORED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "recording_s3_write_errored",
        "Number of flush attempts that failed to upload to the object store"
    )
    .expect("recording_s3_write_errored metric registration")
});

pub static S3_LINES_WRITTEN_HISTOGRAM: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "recording_s3_lines_written_histogram",
        "Number of lines (messages) written per flushed batch"
    )
    .expect("recording_s3_lines_written_histogram metric registration")
});

pub static BLOB_INGESTION_S3_KB_WRITTEN: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "recording_blob_ingestion_s3_kb_written",
        "Uncompressed kilobytes written per flushed batch"
    )
    .expect("recording_blob_ingestion_s3_kb_written metric registration")
});

pub static SESSION_AGE_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "recording_blob_ingestion_session_age_seconds",
        "Wall-clock age in memory of a buffer at flush time, labeled by flush reason",
        &["flush_reason"]
    )
    .expect("recording_blob_ingestion_session_age_seconds metric registration")
});

pub static SESSION_SIZE_KB: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "recording_blob_ingestion_session_size_kb",
        "Uncompressed size in kilobytes of a buffer at flush time"
    )
    .expect("recording_blob_ingestion_session_size_kb metric registration")
});

pub static SESSION_LINES: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "recording_blob_ingestion_session_lines",
        "Number of lines in a buffer at flush time"
    )
    .expect("recording_blob_ingestion_session_lines metric registration")
});

pub static SESSION_FLUSH_TIME_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "recording_blob_ingestion_session_flush_time_seconds",
        "Wall-clock duration of a flush attempt, from swap to endFlush"
    )
    .expect("recording_blob_ingestion_session_flush_time_seconds metric registration")
});
