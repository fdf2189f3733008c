//! 복제 클라이언트 에러 타입

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BinlogError {
    /// 소켓 연결/협상 단계의 실패
    #[error("MySQL 연결 에러: {0}")]
    Connection(String),

    /// 자격 증명 거부 또는 지원하지 않는 인증 방식
    #[error("인증 실패: {message} (code={code}, state={sql_state})")]
    Authentication {
        code: u16,
        sql_state: String,
        message: String,
    },

    /// 서버가 보낸 에러 패킷
    #[error("서버 에러 {code} ({sql_state}): {message}")]
    Server {
        code: u16,
        sql_state: String,
        message: String,
    },

    /// 단일 이벤트 디코딩 실패 (스트림은 계속 진행)
    #[error("이벤트 디코딩 에러: {0}")]
    Decode(String),

    #[error("스트림이 종료되었습니다")]
    EndOfStream,

    #[error("잘못된 상태: {0}")]
    State(String),

    #[error("I/O 에러: {0}")]
    Io(#[from] io::Error),

    #[error("프로토콜 에러: {0}")]
    Protocol(String),

    #[error("GTID 처리 에러: {0}")]
    Gtid(String),

    #[error("설정 에러: {0}")]
    Config(String),

    #[error("Timeout 에러: {0}")]
    Timeout(String),
}

impl BinlogError {
    pub fn authentication(message: impl Into<String>) -> Self {
        BinlogError::Authentication {
            code: 0,
            sql_state: String::new(),
            message: message.into(),
        }
    }

    /// 소켓이 끊어졌거나 스트림이 끝난 경우.
    /// 이런 실패는 프레임 단위로 건너뛸 수 없고 수신 루프를 종료시킨다.
    pub fn is_connection_loss(&self) -> bool {
        match self {
            BinlogError::EndOfStream => true,
            BinlogError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BinlogError>;
