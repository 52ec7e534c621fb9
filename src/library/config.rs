use crate::library::error::SpeedTestError;
use std::{fmt, time::Duration};

pub const DEFAULT_URL: &str = "http://speedtest.tele2.net/1MB.zip";
pub const MIN_CONNECTIONS: usize = 1;
pub const MAX_CONNECTIONS: usize = 10;
pub const DEFAULT_UPLOAD_SIZE: usize = 10 * 1024 * 1024;
const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);
/// Extra slack the keep-alive timer gives a phase past its timeout ceiling.
pub const KEEP_ALIVE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

impl Direction {
    pub fn title(self) -> &'static str {
        match self {
            Direction::Download => "Download",
            Direction::Upload => "Upload",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Download => f.write_str("download"),
            Direction::Upload => f.write_str("upload"),
        }
    }
}

pub fn check_connections(connections: usize) -> Result<usize, SpeedTestError> {
    if (MIN_CONNECTIONS..=MAX_CONNECTIONS).contains(&connections) {
        Ok(connections)
    } else {
        Err(SpeedTestError::InvalidConnections(connections))
    }
}

/// Everything one phase needs to know to set up its transfers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    pub direction: Direction,
    pub url: String,
    pub connections: usize,
    pub timeout: Duration,
    pub upload_size: usize,
    pub socket_buffer: Option<usize>,
    pub bypass_proxy: bool,
}

impl TransferPlan {
    pub fn download(url: &str, connections: usize) -> TransferPlan {
        TransferPlan {
            direction: Direction::Download,
            url: url.to_string(),
            connections,
            timeout: DEFAULT_DOWNLOAD_TIMEOUT,
            upload_size: 0,
            socket_buffer: None,
            bypass_proxy: false,
        }
    }

    pub fn upload(url: &str, connections: usize, upload_size: usize) -> TransferPlan {
        TransferPlan {
            direction: Direction::Upload,
            url: url.to_string(),
            connections,
            timeout: DEFAULT_UPLOAD_TIMEOUT,
            upload_size,
            socket_buffer: None,
            bypass_proxy: false,
        }
    }

    pub fn validate(&self) -> Result<(), SpeedTestError> {
        check_connections(self.connections)?;
        if self.url.trim().is_empty() {
            return Err(SpeedTestError::MissingUrl);
        }
        if self.direction == Direction::Upload && self.upload_size == 0 {
            return Err(SpeedTestError::InvalidUploadSize);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SpeedTest {
    url: String,
    connections: usize,
    download: bool,
    upload: bool,
    upload_size: usize,
    download_timeout: Duration,
    upload_timeout: Duration,
    socket_buffer: Option<usize>,
    bypass_proxy: bool,
}

impl SpeedTest {
    pub fn new(url: &str) -> SpeedTest {
        SpeedTest {
            url: url.to_string(),
            connections: MIN_CONNECTIONS,
            download: false,
            upload: false,
            upload_size: DEFAULT_UPLOAD_SIZE,
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
            upload_timeout: DEFAULT_UPLOAD_TIMEOUT,
            socket_buffer: None,
            bypass_proxy: false,
        }
    }
    #[inline(always)]
    pub fn get_url(&self) -> &str {
        &self.url
    }
    #[inline(always)]
    pub fn get_connections(&self) -> usize {
        self.connections
    }
    #[inline(always)]
    pub fn set_connections(&mut self, connections: usize) -> &mut Self {
        self.connections = connections;
        self
    }
    #[inline(always)]
    pub fn set_download(&mut self, enabled: bool) -> &mut Self {
        self.download = enabled;
        self
    }
    #[inline(always)]
    pub fn set_upload(&mut self, enabled: bool) -> &mut Self {
        self.upload = enabled;
        self
    }
    #[inline(always)]
    pub fn set_upload_size(&mut self, bytes: usize) -> &mut Self {
        self.upload_size = bytes;
        self
    }
    #[inline(always)]
    pub fn set_download_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.download_timeout = timeout;
        self
    }
    #[inline(always)]
    pub fn set_upload_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.upload_timeout = timeout;
        self
    }
    #[inline(always)]
    pub fn set_socket_buffer(&mut self, bytes: Option<usize>) -> &mut Self {
        self.socket_buffer = bytes;
        self
    }
    #[inline(always)]
    pub fn set_bypass_proxy(&mut self, enabled: bool) -> &mut Self {
        self.bypass_proxy = enabled;
        self
    }
    pub fn build(&mut self) -> Result<Self, SpeedTestError> {
        if !self.download && !self.upload {
            return Err(SpeedTestError::NoPhaseSelected);
        }
        if self.url.trim().is_empty() {
            return Err(SpeedTestError::MissingUrl);
        }
        check_connections(self.connections)?;
        if self.upload && self.upload_size == 0 {
            return Err(SpeedTestError::InvalidUploadSize);
        }
        Ok(self.clone())
    }

    /// Phases in the order they run: download first, then upload.
    pub fn plans(&self) -> Vec<TransferPlan> {
        let mut plans: Vec<TransferPlan> = Vec::with_capacity(2);
        if self.download {
            let mut plan = TransferPlan::download(&self.url, self.connections);
            plan.timeout = self.download_timeout;
            plans.push(plan);
        }
        if self.upload {
            let mut plan = TransferPlan::upload(&self.url, self.connections, self.upload_size);
            plan.timeout = self.upload_timeout;
            plans.push(plan);
        }
        for plan in plans.iter_mut() {
            plan.socket_buffer = self.socket_buffer;
            plan.bypass_proxy = self.bypass_proxy;
        }
        plans
    }
}
