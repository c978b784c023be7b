//! Refresh subsystem: strategy decisions, the per-data-type refresh manager,
//! the self-healing backfill, and the trading calendar they share.

pub mod backfill;
pub mod calendar;
pub mod manager;
pub mod strategy;
