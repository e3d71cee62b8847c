use thiserror::Error;

/// A decoder failed to turn a frame into a canonical record.
#[derive(Debug, Error, Clone)]
pub enum DecodeError {
    #[error("sentence had no checksum separator")]
    NoChecksum,
    #[error("checksum mismatch: sentence said {declared:02X}, computed {computed:02X}")]
    ChecksumMismatch { declared: u8, computed: u8 },
    #[error("sentence type {0} is not handled by this decoder")]
    UnsupportedSentence(String),
    #[error("fix not valid (status/quality flag rejected the sentence)")]
    FixNotValid,
    #[error("malformed {field} in {sentence} sentence")]
    MalformedField { sentence: String, field: &'static str },
    #[error("buffer contained no surviving sentence")]
    NoSentence,
    #[error("buffer was not valid ASCII")]
    NotAscii,
}

/// The central or plugin validator rejected a record.
#[derive(Debug, Error, Clone)]
pub enum ValidationError {
    #[error("device id is empty")]
    EmptyDeviceId,
    #[error("latitude {0} out of range [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("longitude {0} out of range [-180, 180]")]
    LongitudeOutOfRange(f64),
    #[error("position is null island (0, 0)")]
    NullIsland,
    #[error("timestamp {0} outside of the accepted ingest window")]
    TimestampOutOfWindow(chrono::DateTime<chrono::Utc>),
    #[error("speed {0} km/h out of range [0, 1000]")]
    SpeedOutOfRange(f64),
    #[error("heading {0} out of range [0, 360)")]
    HeadingOutOfRange(f64),
    #[error("satellite count {0} out of range [0, 50]")]
    SatelliteCountOutOfRange(i32),
    #[error("hdop {0} out of range [0, 50]")]
    HdopOutOfRange(f64),
}

/// Transient failure handing a record to the bus; the Resilience Core may retry.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("broker unreachable: {0}")]
    BrokerUnavailable(String),
    #[error("producer queue full")]
    QueueFull,
    #[error("broker rejected the message: {0}")]
    Rejected(String),
    #[error(transparent)]
    Circuit(#[from] CircuitOpenError),
}

#[derive(Debug, Error, Clone, Copy)]
#[error("circuit breaker is open, fast-failing publish")]
pub struct CircuitOpenError;

/// A plugin's init hook failed; the plugin is isolated and skipped.
#[derive(Debug, Error)]
#[error("plugin `{plugin}` failed to initialize: {reason}")]
pub struct PluginInitError {
    pub plugin: String,
    pub reason: String,
}

/// A plugin hook raised during normal operation (decode/validate/cleanup).
#[derive(Debug, Error)]
#[error("plugin `{plugin}` failed during {hook}: {reason}")]
pub struct PluginRuntimeError {
    pub plugin: String,
    pub hook: &'static str,
    pub reason: String,
}

#[derive(Debug, Error)]
#[error("shutdown deadline exceeded before all in-flight records were flushed")]
pub struct FlushTimeoutError;

#[derive(Debug, Error, Clone, Copy)]
#[error("operation cancelled by shutdown signal")]
pub struct OperationCancelled;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}
