use std::collections::HashMap;
use std::time::{Duration, SystemTime};

/// Read-only statistics taken from a connection primitive.
#[derive(Clone, Debug, Default)]
pub struct StatsSnapshot {
    /// Selected pair as reported by the transport, when the primitive
    /// exposes it.
    pub selected_pair_id: Option<String>,
    pub candidate_pairs: Vec<CandidatePairStats>,
    pub candidates: HashMap<String, CandidateStats>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CandidatePairStats {
    pub id: String,
    pub local_candidate_id: String,
    pub remote_candidate_id: String,
    pub selected: bool,
    pub nominated: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CandidateStats {
    pub id: String,
    /// Transport protocol, e.g. "udp" or "tcp".
    pub protocol: String,
    /// "host", "srflx", "prflx" or "relay".
    pub candidate_type: String,
    pub address: Option<String>,
    pub port: Option<u16>,
}

impl StatsSnapshot {
    pub fn selected_pair(&self) -> Option<&CandidatePairStats> {
        let by_transport = self
            .selected_pair_id
            .as_ref()
            .and_then(|id| self.candidate_pairs.iter().find(|pair| &pair.id == id));
        by_transport.or_else(|| self.candidate_pairs.iter().find(|pair| pair.selected))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionReport {
    pub pair_id: String,
    /// Protocol of the remote side of the selected pair.
    pub protocol: String,
    /// Candidate type of the remote side of the selected pair.
    pub candidate_type: String,
    pub local_candidate_type: Option<String>,
    pub remote_address: Option<String>,
    /// Time from session construction to this report.
    pub elapsed: Duration,
    pub taken_at: SystemTime,
}

impl ConnectionReport {
    pub fn summary(&self) -> String {
        format!(
            "{} {} {:.1}",
            self.protocol,
            self.candidate_type,
            self.elapsed.as_secs_f64()
        )
    }
}

pub fn extract_report(snapshot: &StatsSnapshot, elapsed: Duration) -> Option<ConnectionReport> {
    let pair = snapshot.selected_pair()?;
    let remote = snapshot.candidates.get(&pair.remote_candidate_id)?;
    let local = snapshot.candidates.get(&pair.local_candidate_id);
    Some(ConnectionReport {
        pair_id: pair.id.clone(),
        protocol: remote.protocol.clone(),
        candidate_type: remote.candidate_type.clone(),
        local_candidate_type: local.map(|candidate| candidate.candidate_type.clone()),
        remote_address: remote.address.clone(),
        elapsed,
        taken_at: SystemTime::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, protocol: &str, kind: &str) -> (String, CandidateStats) {
        (
            id.to_string(),
            CandidateStats {
                id: id.to_string(),
                protocol: protocol.to_string(),
                candidate_type: kind.to_string(),
                address: Some("10.0.0.3".into()),
                port: Some(5000),
            },
        )
    }

    fn pair(id: &str, local: &str, remote: &str, selected: bool) -> CandidatePairStats {
        CandidatePairStats {
            id: id.into(),
            local_candidate_id: local.into(),
            remote_candidate_id: remote.into(),
            selected,
            nominated: selected,
        }
    }

    #[test]
    fn transport_selected_pair_wins_over_flag() {
        let snapshot = StatsSnapshot {
            selected_pair_id: Some("p2".into()),
            candidate_pairs: vec![pair("p1", "l1", "r1", true), pair("p2", "l1", "r2", false)],
            candidates: HashMap::from([
                candidate("l1", "udp", "host"),
                candidate("r1", "udp", "host"),
                candidate("r2", "tcp", "relay"),
            ]),
        };
        let report = extract_report(&snapshot, Duration::from_millis(1500)).expect("report");
        assert_eq!(report.pair_id, "p2");
        assert_eq!(report.protocol, "tcp");
        assert_eq!(report.candidate_type, "relay");
        assert_eq!(report.local_candidate_type.as_deref(), Some("host"));
        assert_eq!(report.summary(), "tcp relay 1.5");
    }

    #[test]
    fn falls_back_to_flagged_pair() {
        let snapshot = StatsSnapshot {
            selected_pair_id: Some("missing".into()),
            candidate_pairs: vec![pair("p1", "l1", "r1", false), pair("p2", "l1", "r1", true)],
            candidates: HashMap::from([
                candidate("l1", "udp", "host"),
                candidate("r1", "udp", "srflx"),
            ]),
        };
        let report = extract_report(&snapshot, Duration::ZERO).expect("report");
        assert_eq!(report.pair_id, "p2");
        assert_eq!(report.candidate_type, "srflx");
    }

    #[test]
    fn no_selected_pair_yields_nothing() {
        let snapshot = StatsSnapshot {
            selected_pair_id: None,
            candidate_pairs: vec![pair("p1", "l1", "r1", false)],
            candidates: HashMap::new(),
        };
        assert!(extract_report(&snapshot, Duration::ZERO).is_none());
    }
}
