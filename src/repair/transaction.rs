use serde::Serialize;

use crate::error::RepairResult;
use crate::hbm::types::{Channel, LaneError, RepairType, RowError, Site};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum RepairTarget {
    Lane { lane: LaneError },
    Row { row: RowError },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum Outcome {
    Pending,
    Success,
    Failed(String),
}

/// One repair attempt as recorded for telemetry: inputs, computed values,
/// wrapper data before and after, and the outcome. Emitted for every
/// attempt, failed ones included.
#[derive(Debug, Clone, Serialize)]
pub struct RepairTransaction {
    #[serde(flatten)]
    pub target: RepairTarget,
    pub repair_type: RepairType,
    /// Unset when the failing row's bus could not be mapped to a channel.
    pub site: Option<Site>,
    pub channel: Option<Channel>,
    pub dword: Option<u32>,
    pub byte: Option<u32>,
    pub remap_value: Option<u16>,
    pub remap_mask: Option<u16>,
    pub skip_verify: bool,
    pub pseudo_repair: bool,
    pub before: Vec<u32>,
    pub after: Vec<u32>,
    pub origin_test_id: Option<u32>,
    pub outcome: Outcome,
    pub elapsed_us: u64,
}

impl RepairTransaction {
    pub fn lane(repair_type: RepairType, site: Site, channel: Channel, lane: LaneError, skip_verify: bool, pseudo: bool) -> Self {
        let mut tx = Self::new(RepairTarget::Lane { lane }, repair_type, skip_verify, pseudo);
        tx.site = Some(site);
        tx.channel = Some(channel);
        tx
    }

    pub fn row(repair_type: RepairType, row: &RowError, pseudo: bool) -> Self {
        let mut tx = Self::new(RepairTarget::Row { row: row.clone() }, repair_type, false, pseudo);
        tx.origin_test_id = row.origin_test_id;
        tx
    }

    fn new(target: RepairTarget, repair_type: RepairType, skip_verify: bool, pseudo: bool) -> Self {
        Self {
            target,
            repair_type,
            site: None,
            channel: None,
            dword: None,
            byte: None,
            remap_value: None,
            remap_mask: None,
            skip_verify,
            pseudo_repair: pseudo,
            before: Vec::new(),
            after: Vec::new(),
            origin_test_id: None,
            outcome: Outcome::Pending,
            elapsed_us: 0,
        }
    }

    pub fn finish<T>(&mut self, result: &RepairResult<T>, elapsed_us: u64) {
        self.elapsed_us = elapsed_us;
        self.outcome = match result {
            Ok(_) => Outcome::Success,
            Err(err) => Outcome::Failed(err.to_string()),
        };
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == Outcome::Success
    }

    /// Diagnostic line naming everything needed to reproduce the attempt.
    pub fn describe(&self) -> String {
        let fmt_opt = |v: Option<u32>| v.map_or_else(|| "-".to_string(), |v| v.to_string());
        let fmt_hex = |v: Option<u16>| v.map_or_else(|| "-".to_string(), |v| format!("{:#06x}", v));
        format!(
            "{:?} repair site {} ch {} dword {} byte {} value {} mask {}",
            self.repair_type,
            fmt_opt(self.site),
            fmt_opt(self.channel),
            fmt_opt(self.dword),
            fmt_opt(self.byte),
            fmt_hex(self.remap_value),
            fmt_hex(self.remap_mask),
        )
    }
}
