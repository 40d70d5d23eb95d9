//! API Routes Module
//!
//! 운영용 HTTP 표면
//!
//! # Routes
//! - `/health` - 헬스 체크
//! - `/ws` - 잔액/환율 토픽 구독

pub mod health;
pub mod ws;
