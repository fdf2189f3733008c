//! MariaDB GTID 관리
//!
//! GTID 형식: domain-server-sequence (예: "0-1-100")
//! 도메인별로 가장 최근 커밋된 GTID 하나만 유지한다: "0-1-100,1-2-50"

use crate::error::{BinlogError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// 서버의 현재 위치를 그대로 쓰라는 요청 값
pub const CURRENT_POSITION: &str = "gtid_current_pos";

fn gtid_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\d+)-(\d+)-(\d+)$").unwrap_or_else(|e| panic!("invalid GTID pattern: {}", e))
    })
}

/// 단일 MariaDB GTID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MariaGtid {
    pub domain_id: u32,
    pub server_id: u32,
    pub sequence: u64,
}

impl MariaGtid {
    pub fn new(domain_id: u32, server_id: u32, sequence: u64) -> Self {
        MariaGtid {
            domain_id,
            server_id,
            sequence,
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let caps = gtid_pattern()
            .captures(s)
            .ok_or_else(|| BinlogError::Gtid(format!("Invalid GTID format: '{}'", s)))?;

        let field = |i: usize| caps.get(i).map(|m| m.as_str()).unwrap_or_default();
        let domain_id = field(1)
            .parse()
            .map_err(|_| BinlogError::Gtid(format!("Invalid domain id in '{}'", s)))?;
        let server_id = field(2)
            .parse()
            .map_err(|_| BinlogError::Gtid(format!("Invalid server id in '{}'", s)))?;
        let sequence = field(3)
            .parse()
            .map_err(|_| BinlogError::Gtid(format!("Invalid sequence in '{}'", s)))?;

        Ok(MariaGtid::new(domain_id, server_id, sequence))
    }
}

impl fmt::Display for MariaGtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.domain_id, self.server_id, self.sequence)
    }
}

impl FromStr for MariaGtid {
    type Err = BinlogError;

    fn from_str(s: &str) -> Result<Self> {
        MariaGtid::parse(s)
    }
}

/// 도메인별 GTID 집합. 순서는 처음 등장한 순서를 유지한다.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidSet {
    entries: Vec<MariaGtid>,
}

impl GtidSet {
    pub fn new() -> Self {
        GtidSet::default()
    }

    /// "0-1-100,1-2-50" 형식 파싱. 대괄호("[..]")로 감싸져 있어도 된다.
    pub fn parse(gtid_str: &str) -> Result<Self> {
        let trimmed = gtid_str
            .trim()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .trim();

        let mut gtid_set = GtidSet::new();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("NULL") {
            return Ok(gtid_set);
        }

        for part in trimmed.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            gtid_set.insert(MariaGtid::parse(part)?);
        }
        Ok(gtid_set)
    }

    pub fn get(&self, domain_id: u32) -> Option<&MariaGtid> {
        self.entries.iter().find(|g| g.domain_id == domain_id)
    }

    /// 같은 도메인이 있으면 그 자리에서 교체, 없으면 끝에 추가
    pub fn insert(&mut self, gtid: MariaGtid) {
        match self.entries.iter_mut().find(|g| g.domain_id == gtid.domain_id) {
            Some(existing) => *existing = gtid,
            None => self.entries.push(gtid),
        }
    }

    /// sequence가 기존 값 이상일 때만 교체한다. 교체/추가되면 true.
    pub fn advance(&mut self, gtid: MariaGtid) -> bool {
        match self.entries.iter_mut().find(|g| g.domain_id == gtid.domain_id) {
            Some(existing) if existing.sequence > gtid.sequence => false,
            Some(existing) => {
                *existing = gtid;
                true
            }
            None => {
                self.entries.push(gtid);
                true
            }
        }
    }

    pub fn contains_domain(&self, domain_id: u32) -> bool {
        self.get(domain_id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MariaGtid> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.entries.iter().map(|g| g.to_string()).collect();
        f.write_str(&parts.join(","))
    }
}

impl FromStr for GtidSet {
    type Err = BinlogError;

    fn from_str(s: &str) -> Result<Self> {
        GtidSet::parse(s)
    }
}

/// 재연결 협상 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    /// `@slave_connect_state`로 보낼 집합. 서버에 있는 도메인만 담는다.
    pub request: GtidSet,
    /// 클라이언트가 추적할 집합. 서버가 모르는 요청 도메인도 뒤에 남긴다.
    pub tracked: GtidSet,
}

/// 요청된 시작 GTID 집합을 서버 현재 위치와 맞춘다.
///
/// - 요청이 비었거나 `gtid_current_pos`이면 서버 현재 위치 그대로
/// - 서버에 있는 도메인: 요청에 있으면 요청 값 유지, 없으면 서버 값 채택
/// - 요청에만 있는 도메인은 서버로 보내지 않고 추적 집합에만 남긴다
pub fn reconcile(requested: &str, server_current: &GtidSet) -> Result<Reconciled> {
    let requested = requested.trim();
    if requested.is_empty() || requested == CURRENT_POSITION {
        debug!("Using server current GTID position {}", server_current);
        return Ok(Reconciled {
            request: server_current.clone(),
            tracked: server_current.clone(),
        });
    }

    let requested = GtidSet::parse(requested)?;
    let mut request = GtidSet::new();

    for server_gtid in server_current.iter() {
        match requested.get(server_gtid.domain_id) {
            Some(client_gtid) => request.insert(*client_gtid),
            None => request.insert(*server_gtid),
        }
    }

    let mut tracked = request.clone();
    for client_gtid in requested.iter() {
        if !tracked.contains_domain(client_gtid.domain_id) {
            debug!(
                "Domain {} is unknown to the server, keeping {} locally",
                client_gtid.domain_id, client_gtid
            );
            tracked.insert(*client_gtid);
        }
    }

    Ok(Reconciled { request, tracked })
}

/// 서버가 이미 지웠을 수 있는 도메인 (요청 sequence < 가장 오래된 binlog의 sequence)
pub fn purged_domains<'a>(
    requested: &'a GtidSet,
    oldest: &'a GtidSet,
) -> impl Iterator<Item = (&'a MariaGtid, &'a MariaGtid)> {
    requested.iter().filter_map(move |req| {
        oldest
            .get(req.domain_id)
            .filter(|old| req.sequence < old.sequence)
            .map(|old| (req, old))
    })
}

/// 트랜잭션 경계에서 커밋된 GTID를 추적
#[derive(Debug, Clone, Default)]
pub struct GtidTracker {
    committed: GtidSet,
    current: Option<MariaGtid>,
    in_transaction: bool,
}

impl GtidTracker {
    pub fn new(committed: GtidSet) -> Self {
        GtidTracker {
            committed,
            current: None,
            in_transaction: false,
        }
    }

    /// GTID 이벤트: 진행 중인 트랜잭션의 GTID로 기록
    pub fn on_gtid(&mut self, gtid: MariaGtid) {
        self.current = Some(gtid);
        self.in_transaction = true;
    }

    /// XID / COMMIT: 진행 중인 GTID를 커밋 집합에 반영
    pub fn on_commit(&mut self) {
        if !self.in_transaction {
            return;
        }
        self.in_transaction = false;
        if let Some(gtid) = self.current {
            if !self.committed.advance(gtid) {
                warn!(
                    "Ignoring GTID {} older than committed {:?}",
                    gtid,
                    self.committed.get(gtid.domain_id)
                );
            }
        }
    }

    /// QUERY 이벤트. ROLLBACK은 반영 없이 종료, BEGIN은 무시, 그 외는 커밋으로 본다.
    pub fn on_query(&mut self, sql: &str) {
        let statement = sql.trim();
        if statement.is_empty() || statement.eq_ignore_ascii_case("BEGIN") {
            return;
        }
        if statement.eq_ignore_ascii_case("ROLLBACK") {
            self.in_transaction = false;
            return;
        }
        self.on_commit();
    }

    pub fn committed(&self) -> &GtidSet {
        &self.committed
    }

    pub fn current(&self) -> Option<&MariaGtid> {
        self.current.as_ref()
    }

    pub fn is_in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn reset(&mut self, committed: GtidSet) {
        self.committed = committed;
        self.current = None;
        self.in_transaction = false;
    }
}
