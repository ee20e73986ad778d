//! Error types for the data path.
//!
//! Errors are organized by domain:
//! - [`ConfigError`]: configuration and lifecycle misuse
//! - [`DmaError`]: DMA allocation and binding failures
//! - [`OffloadError`]: transmit frame parsing and offload policy failures
//!
//! The unified [`Error`] enum wraps all domain errors.

// =============================================================================
// Configuration Errors
// =============================================================================

/// Configuration and lifecycle errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// The instance is already started.
    AlreadyStarted,
    /// Ring size is not a power of two or is out of range.
    InvalidRingSize,
    /// MTU out of the supported range.
    InvalidMtu,
    /// A copy or block threshold is out of range.
    InvalidThreshold,
    /// A scatter/gather cookie limit is out of range.
    InvalidCookieLimit,
    /// Queue count is zero.
    InvalidQueueCount,
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ConfigError {
    /// Returns a human-readable description of the error.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ConfigError::AlreadyStarted => "instance already started",
            ConfigError::InvalidRingSize => "invalid ring size",
            ConfigError::InvalidMtu => "invalid MTU",
            ConfigError::InvalidThreshold => "invalid threshold",
            ConfigError::InvalidCookieLimit => "invalid cookie limit",
            ConfigError::InvalidQueueCount => "invalid queue count",
        }
    }
}

// =============================================================================
// DMA Errors
// =============================================================================

/// DMA allocation and binding errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DmaError {
    /// The platform reported exhausted resources.
    ResourceExhausted,
    /// A scatter/gather bind failed.
    BindFailed,
    /// A bind produced more cookies than the handle allows.
    TooManyCookies,
}

impl core::fmt::Display for DmaError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl DmaError {
    /// Returns a human-readable description of the error.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            DmaError::ResourceExhausted => "dma resources exhausted",
            DmaError::BindFailed => "dma bind failed",
            DmaError::TooManyCookies => "too many dma cookies",
        }
    }
}

// =============================================================================
// Offload Errors
// =============================================================================

/// Transmit frame parsing and offload policy errors. A frame that fails
/// with one of these is dropped, never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OffloadError {
    /// The frame chain could not be parsed.
    ParseFailed,
    /// No L2 information available for the requested offload.
    MissingL2Info,
    /// No L3 information available for the requested offload.
    MissingL3Info,
    /// No L4 information available for the requested offload.
    MissingL4Info,
    /// The L3 protocol does not match the requested offload.
    BadL3Proto,
    /// The L4 protocol does not match the requested offload.
    BadL4Proto,
    /// Inner offloads were requested on an unsupported tunnel type.
    UnsupportedTunnel,
    /// The tunnel headers could not be fully resolved.
    MissingTunnelInfo,
    /// An outer L4 checksum was requested; the hardware has no support.
    UnsupportedOuterCksum,
    /// Segmentation offload requires both checksum offloads.
    LsoMissingCksum,
}

impl core::fmt::Display for OffloadError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl OffloadError {
    /// Returns a human-readable description of the error.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            OffloadError::ParseFailed => "frame parse failed",
            OffloadError::MissingL2Info => "missing L2 info",
            OffloadError::MissingL3Info => "missing L3 info",
            OffloadError::MissingL4Info => "missing L4 info",
            OffloadError::BadL3Proto => "unsupported L3 protocol",
            OffloadError::BadL4Proto => "unsupported L4 protocol",
            OffloadError::UnsupportedTunnel => "unsupported tunnel type",
            OffloadError::MissingTunnelInfo => "incomplete tunnel headers",
            OffloadError::UnsupportedOuterCksum => "outer L4 checksum unsupported",
            OffloadError::LsoMissingCksum => "lso requires checksum offloads",
        }
    }
}

// =============================================================================
// Unified Error Type
// =============================================================================

/// Unified error wrapping all domain errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Configuration error.
    Config(ConfigError),
    /// DMA error.
    Dma(DmaError),
    /// Offload error.
    Offload(OffloadError),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Config(e) => write!(f, "config: {}", e.as_str()),
            Error::Dma(e) => write!(f, "dma: {}", e.as_str()),
            Error::Offload(e) => write!(f, "offload: {}", e.as_str()),
        }
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}

impl From<DmaError> for Error {
    fn from(e: DmaError) -> Self {
        Error::Dma(e)
    }
}

impl From<OffloadError> for Error {
    fn from(e: OffloadError) -> Self {
        Error::Offload(e)
    }
}

/// Result type alias for data-path operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = core::result::Result<T, ConfigError>;

/// Result type alias for DMA operations.
pub type DmaResult<T> = core::result::Result<T, DmaError>;

// =============================================================================
// Unit Tests
// =============================================================================
