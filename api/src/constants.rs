//! Application constants

/// Default GCS bucket for committed media and in-flight chunks
pub const DEFAULT_BUCKET_NAME: &str = "lectern_media";

/// Upload sessions are honored for 24 hours after creation
pub const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;

/// Maximum size of a single chunk request (64 MB)
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// Signed URL expiry time in seconds (15 minutes)
pub const DEFAULT_SIGNED_URL_EXPIRY_SECS: u32 = 15 * 60;

/// Media types an upload session may declare
pub const ALLOWED_MIME_TYPES: &[&str] = &[
    "video/mp4",
    "video/webm",
    "video/quicktime",
    "video/x-matroska",
    "video/x-msvideo",
    "audio/mpeg",
    "audio/mp4",
    "audio/wav",
    "audio/x-wav",
    "audio/webm",
    "audio/ogg",
];

/// Quota sentinel meaning "no ceiling"
pub const UNLIMITED: i64 = -1;

pub const BYTES_PER_MB: u64 = 1024 * 1024;

// Key prefixes in the session/job store
pub const SESSION_KEY_PREFIX: &str = "upload_session:";
pub const JOB_KEY_PREFIX: &str = "transcription_job:";
pub const ACTIVE_JOB_KEY_PREFIX: &str = "transcription_active:";
pub const LATEST_JOB_KEY_PREFIX: &str = "transcription_latest:";

// Job progress milestones
pub const PROGRESS_PREPARING: u8 = 5;
pub const PROGRESS_UPLOADING: u8 = 10;
pub const PROGRESS_PROCESSING: u8 = 50;
pub const PROGRESS_TRANSCRIBING: u8 = 60;
pub const PROGRESS_COMPLETED: u8 = 100;

pub fn get_extension(content_type: &str) -> &'static str {
    match content_type {
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        "video/quicktime" => "mov",
        "video/x-matroska" => "mkv",
        "video/x-msvideo" => "avi",
        "audio/mpeg" => "mp3",
        "audio/mp4" => "m4a",
        "audio/wav" | "audio/x-wav" => "wav",
        "audio/webm" => "weba",
        "audio/ogg" => "ogg",
        _ => "bin",
    }
}
