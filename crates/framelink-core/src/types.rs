use serde::{Deserialize, Serialize};

// MARK: - Resolution

/// Pixel dimensions of a display target or decode surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const FHD: Self = Self { width: 1920, height: 1080 };
    pub const QHD: Self = Self { width: 2560, height: 1440 };

    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn total_pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}×{}", self.width, self.height)
    }
}

// MARK: - VideoCodec

/// Codec announced by the server. Encoded as `{ "type": "H264" }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum VideoCodec {
    H264,
    H265,
    Unknown,
}

impl VideoCodec {
    /// MIME type handed to platform decoders.
    pub fn mime(&self) -> Option<&'static str> {
        match self {
            Self::H264 => Some("video/avc"),
            Self::H265 => Some("video/hevc"),
            Self::Unknown => None,
        }
    }
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::H264 => write!(f, "H.264"),
            Self::H265 => write!(f, "H.265"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

// MARK: - FoveationParams

/// Fixed-foveated-rendering parameters. The pipeline never interprets them;
/// they travel with the settings and are handed to the GPU backend on present.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FoveationParams {
    pub eye_width: u32,
    pub eye_height: u32,
    pub center_size_x: f32,
    pub center_size_y: f32,
    pub center_shift_x: f32,
    pub center_shift_y: f32,
    pub edge_ratio_x: f32,
    pub edge_ratio_y: f32,
}

// MARK: - StreamSettings

/// Stream parameters negotiated by the connection layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSettings {
    pub fps: f32,
    pub codec: VideoCodec,
    /// Ask the decoder for real-time priority. Best effort.
    pub realtime: bool,
    #[serde(default)]
    pub dashboard_url: String,
    #[serde(rename = "ffr_param", default)]
    pub foveation: Option<FoveationParams>,
}

impl StreamSettings {
    pub fn new(codec: VideoCodec, realtime: bool) -> Self {
        Self {
            fps: 60.0,
            codec,
            realtime,
            dashboard_url: String::new(),
            foveation: None,
        }
    }

    pub fn with_fps(mut self, fps: f32) -> Self {
        self.fps = fps;
        self
    }

    pub fn with_foveation(mut self, foveation: Option<FoveationParams>) -> Self {
        self.foveation = foveation;
        self
    }
}

// MARK: - ConnectionError

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConnectionError {
    NetworkUnreachable,
    ClientUntrusted,
    IncompatibleVersions,
    TimeoutSetUpStream,
    ServerDisconnected { cause: String },
    SystemError { cause: String },
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NetworkUnreachable => write!(f, "network unreachable"),
            Self::ClientUntrusted => write!(f, "client untrusted"),
            Self::IncompatibleVersions => write!(f, "incompatible versions"),
            Self::TimeoutSetUpStream => write!(f, "timed out setting up stream"),
            Self::ServerDisconnected { cause } => write!(f, "server disconnected: {cause}"),
            Self::SystemError { cause } => write!(f, "system error: {cause}"),
        }
    }
}

// MARK: - ConnectionEvent

/// Events produced by the connection layer and forwarded to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConnectionEvent {
    Initial,
    ServerFound { ipaddr: String },
    Connected { settings: StreamSettings },
    StreamStart,
    ServerRestart,
    Error { error: ConnectionError },
}

impl ConnectionEvent {
    /// `true` for events after which decoding must be suspended.
    pub fn suspends_stream(&self) -> bool {
        matches!(self, Self::ServerRestart | Self::Error { .. })
    }
}
