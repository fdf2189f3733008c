//! Binlog 처리 위치 추적
//!
//! 파일명 + 위치, 또는 도메인별 GTID 집합으로 재시작 지점을 추적한다.
//! 모든 필드는 클라이언트 안에서 하나의 락 뒤에 있고, 외부 체크포인트는
//! [`PositionSnapshot`]으로 읽어간다.

use crate::config::ClientConfig;
use crate::error::Result;
use crate::gtid::{GtidSet, GtidTracker, MariaGtid, CURRENT_POSITION};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// binlog 파일은 4 바이트 매직 넘버 뒤부터 이벤트가 시작된다
pub const MIN_BINLOG_POSITION: u64 = 4;

/// 재시작 지점
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResumePosition {
    /// filename이 None이면 서버의 현재 위치를 조회한다. ""이면 가장 오래된 binlog부터.
    File {
        filename: Option<String>,
        position: u64,
    },
    Gtid(String),
}

impl fmt::Display for ResumePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResumePosition::File {
                filename: Some(filename),
                position,
            } => write!(f, "{}/{}", filename, position),
            ResumePosition::File { filename: None, .. } => f.write_str("<current>"),
            ResumePosition::Gtid(gtid) => write!(f, "GTID {}", gtid),
        }
    }
}

/// 위치 / GTID 상태 (클라이언트가 락으로 감싸서 보관)
#[derive(Debug, Clone)]
pub struct PositionState {
    binlog_filename: Option<String>,
    binlog_position: u64,
    /// Some이면 GTID 모드. 협상 전에는 요청 값, 협상 후에는 맞춰진 값.
    gtid_request: Option<String>,
    tracker: GtidTracker,
}

impl PositionState {
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let mut state = PositionState {
            binlog_filename: config.binlog_filename.clone(),
            binlog_position: config.binlog_position,
            gtid_request: None,
            tracker: GtidTracker::default(),
        };
        state.set_gtid_set(config.gtid_set.clone())?;
        Ok(state)
    }

    pub fn binlog_filename(&self) -> Option<&str> {
        self.binlog_filename.as_deref()
    }

    pub fn binlog_position(&self) -> u64 {
        self.binlog_position
    }

    pub fn set_binlog_filename(&mut self, filename: Option<String>) {
        self.binlog_filename = filename;
    }

    pub fn set_binlog_position(&mut self, position: u64) {
        self.binlog_position = position;
    }

    /// 최소값보다 작은 위치를 끌어올린다. 바뀌었으면 이전 값을 돌려준다.
    pub fn clamp_position(&mut self) -> Option<u64> {
        if self.binlog_position < MIN_BINLOG_POSITION {
            let previous = self.binlog_position;
            self.binlog_position = MIN_BINLOG_POSITION;
            Some(previous)
        } else {
            None
        }
    }

    pub fn is_gtid_mode(&self) -> bool {
        self.gtid_request.is_some()
    }

    /// 재연결 시 요청할 GTID. 커밋된 값이 있으면 그것을, 없으면 원래 요청을 쓴다.
    pub fn gtid_set(&self) -> Option<String> {
        self.gtid_request.as_ref().map(|request| {
            let committed = self.tracker.committed();
            if committed.is_empty() {
                request.clone()
            } else {
                committed.to_string()
            }
        })
    }

    /// None이 아니면 GTID 모드로 전환하고 파일명이 없을 때 ""로 둔다
    pub fn set_gtid_set(&mut self, gtid: Option<String>) -> Result<()> {
        let committed = match gtid.as_deref().map(str::trim) {
            None | Some("") | Some(CURRENT_POSITION) => GtidSet::new(),
            Some(text) => GtidSet::parse(text)?,
        };
        if gtid.is_some() && self.binlog_filename.is_none() {
            self.binlog_filename = Some(String::new());
        }
        self.tracker.reset(committed);
        self.gtid_request = gtid;
        Ok(())
    }

    /// 협상에서 맞춘 집합을 요청/추적 상태 양쪽에 반영
    pub fn apply_reconciled(&mut self, reconciled: &GtidSet) {
        self.gtid_request = Some(reconciled.to_string());
        self.tracker.reset(reconciled.clone());
    }

    pub fn on_rotate(&mut self, filename: String, position: u64) {
        self.binlog_filename = Some(filename);
        self.binlog_position = position;
    }

    pub fn on_next_position(&mut self, next_position: u64) {
        if next_position > 0 {
            self.binlog_position = next_position;
        }
    }

    pub fn on_gtid(&mut self, gtid: MariaGtid) {
        if self.is_gtid_mode() {
            self.tracker.on_gtid(gtid);
        }
    }

    pub fn on_commit(&mut self) {
        if self.is_gtid_mode() {
            self.tracker.on_commit();
        }
    }

    pub fn on_query(&mut self, sql: &str) {
        if self.is_gtid_mode() {
            self.tracker.on_query(sql);
        }
    }

    pub fn tracker(&self) -> &GtidTracker {
        &self.tracker
    }

    pub fn resume_position(&self) -> ResumePosition {
        match self.gtid_set() {
            Some(gtid) => ResumePosition::Gtid(gtid),
            None => ResumePosition::File {
                filename: self.binlog_filename.clone(),
                position: self.binlog_position,
            },
        }
    }

    pub fn snapshot(&self, server_id: u32) -> PositionSnapshot {
        PositionSnapshot {
            server_id,
            binlog_filename: self.binlog_filename.clone(),
            binlog_position: self.binlog_position,
            gtid_set: self.gtid_set(),
            current_gtid: self.tracker.current().map(|g| g.to_string()),
            in_transaction: self.tracker.is_in_transaction(),
            captured_at: Utc::now(),
        }
    }
}

/// 외부 체크포인트 저장용 위치 스냅샷
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub server_id: u32,
    pub binlog_filename: Option<String>,
    pub binlog_position: u64,
    pub gtid_set: Option<String>,
    /// 진행 중인 트랜잭션의 GTID (아직 커밋 전일 수 있다)
    pub current_gtid: Option<String>,
    pub in_transaction: bool,
    pub captured_at: DateTime<Utc>,
}

impl PositionSnapshot {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "server_id": self.server_id,
            "file": self.binlog_filename,
            "pos": self.binlog_position,
            "gtid": self.gtid_set,
            "current_gtid": self.current_gtid,
            "in_transaction": self.in_transaction,
            "ts": self.captured_at.to_rfc3339(),
        })
    }
}

impl fmt::Display for PositionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PositionSnapshot {{ server_id: {}, file: {:?}, pos: {}, gtid: {:?} }}",
            self.server_id, self.binlog_filename, self.binlog_position, self.gtid_set
        )
    }
}
