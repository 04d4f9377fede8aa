//! Configuration reconciliation for live reload
//!
//! Pure diff between the running check set and a newly loaded one. The plan
//! is advisory: the [`Warden`](crate::warden::Warden) applies it.

use std::collections::HashMap;

use crate::manifest::CheckDef;

/// Actions needed to move from the running set to the proposed set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    /// New checks
    pub start: Vec<CheckDef>,
    /// Removed checks, by name
    pub stop: Vec<String>,
    /// Checks whose definition changed; stopped then started
    pub restart: Vec<CheckDef>,
    /// Unchanged checks, left alone
    pub keep: Vec<String>,
}

impl Plan {
    /// True when applying the plan would not touch any worker
    pub fn is_noop(&self) -> bool {
        self.start.is_empty() && self.stop.is_empty() && self.restart.is_empty()
    }
}

/// Match checks by name and classify each one
pub fn reconcile(current: &[CheckDef], proposed: &[CheckDef]) -> Plan {
    let running: HashMap<&str, &CheckDef> = current.iter().map(|c| (c.name.as_str(), c)).collect();
    let wanted: HashMap<&str, &CheckDef> = proposed.iter().map(|c| (c.name.as_str(), c)).collect();
    let mut plan = Plan::default();

    for def in current {
        if !wanted.contains_key(def.name.as_str()) {
            plan.stop.push(def.name.clone());
        }
    }

    for def in proposed {
        match running.get(def.name.as_str()) {
            None => plan.start.push(def.clone()),
            Some(old) if *old == def => plan.keep.push(def.name.clone()),
            Some(_) => plan.restart.push(def.clone()),
        }
    }

    plan
}
