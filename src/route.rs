//! Route state per check
//!
//! Turns health transitions into announce/withdraw directives and remembers
//! which prefixes are currently announced, so every announce is paired with
//! exactly one withdraw.

use std::collections::BTreeSet;
use std::fmt;
use std::fmt::Write;
use std::net::IpAddr;

use ipnet::IpNet;

use crate::manifest::{CheckDef, NextHop, PathId};

const WELL_KNOWN_COMMUNITIES: &[&str] = &[
    "no-export",
    "no-advertise",
    "no-export-subconfed",
    "internet",
    "local-as",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Announce,
    Withdraw,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Announce => write!(f, "announce"),
            Action::Withdraw => write!(f, "withdraw"),
        }
    }
}

/// Communities split by the attribute they are sent in
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Communities {
    pub standard: Vec<String>,
    pub large: Vec<String>,
    pub extended: Vec<String>,
}

impl Communities {
    pub fn classify(values: &[String]) -> Self {
        let mut communities = Self::default();
        for value in values {
            let parts: Vec<&str> = value.split(':').collect();
            let numeric = parts
                .iter()
                .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()));

            if numeric && parts.len() == 2 {
                communities.standard.push(value.clone());
            } else if numeric && parts.len() == 3 {
                communities.large.push(value.clone());
            } else if WELL_KNOWN_COMMUNITIES.contains(&value.as_str()) {
                communities.standard.push(value.clone());
            } else {
                communities.extended.push(value.clone());
            }
        }
        communities
    }
}

/// Static attributes attached to every route of a check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteAttributes {
    pub next_hop: NextHop,
    pub path_id: Option<PathId>,
    pub as_path: Vec<u32>,
    pub communities: Communities,
    pub med: Option<u32>,
    pub local_preference: Option<u32>,
    pub neighbors: Vec<IpAddr>,
}

impl RouteAttributes {
    pub fn from_check(def: &CheckDef) -> Self {
        Self {
            next_hop: def.nexthop,
            path_id: def.path_id,
            as_path: def.as_path.clone(),
            communities: Communities::classify(&def.communities),
            // a zero metric means no MED attribute
            med: def.metric.filter(|m| *m != 0),
            local_preference: def.local_preference,
            neighbors: def.neighbors.clone(),
        }
    }
}

/// One announce or withdraw for one prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDirective {
    pub check: String,
    pub action: Action,
    pub prefix: IpNet,
    pub attributes: RouteAttributes,
}

fn write_list(line: &mut String, keyword: &str, items: &[String]) {
    if !items.is_empty() {
        let _ = write!(line, " {} [{}]", keyword, items.join(" "));
    }
}

impl RouteDirective {
    /// Render the command line understood by the BGP speaker (no newline)
    pub fn to_command(&self) -> String {
        let attrs = &self.attributes;
        let mut line = String::new();

        if !attrs.neighbors.is_empty() {
            let neighbors: Vec<String> = attrs
                .neighbors
                .iter()
                .map(|n| format!("neighbor {}", n))
                .collect();
            line.push_str(&neighbors.join(", "));
            line.push(' ');
        }

        let _ = write!(
            line,
            "{} route {} next-hop {}",
            self.action, self.prefix, attrs.next_hop
        );
        if let Some(med) = attrs.med {
            let _ = write!(line, " med {}", med);
        }
        if let Some(pref) = attrs.local_preference {
            let _ = write!(line, " local-preference {}", pref);
        }
        if let Some(id) = attrs.path_id {
            let _ = write!(line, " path-id {}", id);
        }
        if !attrs.as_path.is_empty() {
            let asns: Vec<String> = attrs.as_path.iter().map(|a| a.to_string()).collect();
            write_list(&mut line, "as-path", &asns);
        }
        write_list(&mut line, "community", &attrs.communities.standard);
        write_list(&mut line, "large-community", &attrs.communities.large);
        write_list(&mut line, "extended-community", &attrs.communities.extended);

        line
    }
}

/// Announced-prefix bookkeeping for one check
#[derive(Debug)]
pub struct RouteStateMachine {
    check: String,
    prefixes: Vec<IpNet>,
    attributes: RouteAttributes,
    announced: BTreeSet<IpNet>,
}

impl RouteStateMachine {
    pub fn new(def: &CheckDef) -> Self {
        Self {
            check: def.name.clone(),
            prefixes: def.prefixes.clone(),
            attributes: RouteAttributes::from_check(def),
            announced: BTreeSet::new(),
        }
    }

    fn directive(&self, action: Action, prefix: IpNet) -> RouteDirective {
        RouteDirective {
            check: self.check.clone(),
            action,
            prefix,
            attributes: self.attributes.clone(),
        }
    }

    /// Announce every configured prefix not already announced
    pub fn on_healthy(&mut self) -> Vec<RouteDirective> {
        let mut batch = Vec::new();
        for prefix in &self.prefixes {
            if self.announced.insert(*prefix) {
                batch.push(self.directive(Action::Announce, *prefix));
            }
        }
        batch
    }

    /// Withdraw everything announced and forget it
    pub fn withdraw_all(&mut self) -> Vec<RouteDirective> {
        let announced = std::mem::take(&mut self.announced);
        announced
            .into_iter()
            .map(|prefix| self.directive(Action::Withdraw, prefix))
            .collect()
    }

    pub fn announced(&self) -> Vec<IpNet> {
        self.announced.iter().copied().collect()
    }
}
