//! 복제 클라이언트 설정

use crate::error::{BinlogError, Result};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// TLS 모드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    #[default]
    Disabled,
    /// 서버가 지원하면 TLS, 아니면 평문
    Preferred,
    /// TLS 필수, 인증서 검증 없음
    Required,
    /// TLS 필수, 신뢰 저장소로 인증서 체인 검증
    VerifyCa,
    /// VerifyCa + 호스트명 검증
    VerifyIdentity,
}

impl SslMode {
    /// 서버가 TLS를 지원하지 않을 때 연결을 실패시켜야 하는 모드
    pub fn is_required(&self) -> bool {
        matches!(
            self,
            SslMode::Required | SslMode::VerifyCa | SslMode::VerifyIdentity
        )
    }
}

impl fmt::Display for SslMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SslMode::Disabled => "disabled",
            SslMode::Preferred => "preferred",
            SslMode::Required => "required",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyIdentity => "verify-identity",
        };
        f.write_str(name)
    }
}

impl FromStr for SslMode {
    type Err = BinlogError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "disabled" | "disable" | "off" | "false" => Ok(SslMode::Disabled),
            "preferred" | "prefer" => Ok(SslMode::Preferred),
            "required" | "require" => Ok(SslMode::Required),
            "verify-ca" | "verify_ca" => Ok(SslMode::VerifyCa),
            "verify-identity" | "verify_identity" => Ok(SslMode::VerifyIdentity),
            _ => Err(BinlogError::Config(format!("Invalid SSL mode '{}'", s))),
        }
    }
}

/// 복제 클라이언트 설정
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub hostname: String,
    pub port: u16,
    /// 인증 시에만 사용된다. 이벤트 필터가 아니다.
    pub schema: Option<String>,
    pub username: String,
    pub password: String,
    /// 복제 그룹 전체에서 유일해야 한다
    pub server_id: u32,
    /// false면 마지막 이벤트 이후 서버가 보내는 EOF에서 연결을 끊는다
    pub blocking: bool,
    pub ssl_mode: SslMode,
    /// 0이면 협상 워치독을 쓰지 않는다
    pub connect_timeout: Duration,
    pub keep_alive: bool,
    pub keep_alive_interval: Duration,
    /// keep-alive가 끊긴 연결을 복구할 때 한 번의 재연결에 주는 시간
    pub keep_alive_connect_timeout: Duration,
    /// 설정하면 서버가 이 주기로 HEARTBEAT 이벤트를 보낸다
    pub heartbeat_interval: Option<Duration>,
    /// None: 서버의 현재 위치 자동 조회, "": 가장 오래된 binlog부터
    pub binlog_filename: Option<String>,
    pub binlog_position: u64,
    /// Some이면 GTID 모드 (형식: domain-server-sequence[,...])
    pub gtid_set: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            hostname: "localhost".to_string(),
            port: 3306,
            schema: None,
            username: "root".to_string(),
            password: String::new(),
            server_id: 65535,
            blocking: true,
            ssl_mode: SslMode::Disabled,
            connect_timeout: Duration::from_secs(3),
            keep_alive: true,
            keep_alive_interval: Duration::from_secs(60),
            keep_alive_connect_timeout: Duration::from_secs(3),
            heartbeat_interval: None,
            binlog_filename: None,
            binlog_position: 4,
            gtid_set: None,
        }
    }
}

impl ClientConfig {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        ClientConfig {
            hostname: hostname.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_server_id(mut self, server_id: u32) -> Self {
        self.server_id = server_id;
        self
    }

    pub fn with_blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn with_ssl_mode(mut self, ssl_mode: SslMode) -> Self {
        self.ssl_mode = ssl_mode;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_keep_alive(mut self, enabled: bool, interval: Duration) -> Self {
        self.keep_alive = enabled;
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_keep_alive_connect_timeout(mut self, timeout: Duration) -> Self {
        self.keep_alive_connect_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub fn with_binlog_position(mut self, filename: impl Into<String>, position: u64) -> Self {
        self.binlog_filename = Some(filename.into());
        self.binlog_position = position;
        self
    }

    /// GTID 모드로 전환한다. 시작 파일이 없으면 ""(가장 오래된 binlog)로 둔다.
    pub fn with_gtid_set(mut self, gtid_set: impl Into<String>) -> Self {
        if self.binlog_filename.is_none() {
            self.binlog_filename = Some(String::new());
        }
        self.gtid_set = Some(gtid_set.into());
        self
    }

    /// 환경 변수에서 설정 읽기 (DB_HOST, DB_PORT, DB_USER, DB_PASSWORD, DB_NAME ...)
    pub fn from_env() -> Result<Self> {
        let mut config = ClientConfig {
            hostname: env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
            username: env::var("DB_USER").unwrap_or_else(|_| "root".to_string()),
            password: env::var("DB_PASSWORD").unwrap_or_default(),
            schema: env::var("DB_NAME").ok(),
            ..Default::default()
        };

        if let Ok(port) = env::var("DB_PORT") {
            config.port = port
                .parse()
                .map_err(|_| BinlogError::Config(format!("Invalid DB_PORT: {}", port)))?;
        }
        if let Ok(server_id) = env::var("DB_SERVER_ID") {
            config.server_id = server_id
                .parse()
                .map_err(|_| BinlogError::Config(format!("Invalid DB_SERVER_ID: {}", server_id)))?;
        }
        if let Ok(mode) = env::var("DB_SSL_MODE") {
            config.ssl_mode = mode.parse()?;
        }
        if let Ok(blocking) = env::var("DB_BLOCKING") {
            config.blocking = !matches!(blocking.as_str(), "0" | "false" | "no");
        }
        if let Ok(gtid) = env::var("DB_GTID") {
            config = config.with_gtid_set(gtid);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.keep_alive && self.keep_alive_interval.is_zero() {
            return Err(BinlogError::Config(
                "keep-alive interval must be greater than zero".to_string(),
            ));
        }
        if self.keep_alive && self.keep_alive_connect_timeout.is_zero() {
            return Err(BinlogError::Config(
                "keep-alive connect timeout must be greater than zero".to_string(),
            ));
        }
        if let Some(heartbeat) = self.heartbeat_interval {
            if self.keep_alive && heartbeat >= self.keep_alive_interval {
                return Err(BinlogError::Config(format!(
                    "heartbeat interval ({:?}) must be smaller than keep-alive interval ({:?})",
                    heartbeat, self.keep_alive_interval
                )));
            }
        }
        Ok(())
    }
}
