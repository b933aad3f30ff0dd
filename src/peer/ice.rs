use std::collections::VecDeque;

use tracing::warn;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use super::types::{IceCandidate, ParticipantId};

/// Кандидаты, полученные до установки remote description
#[derive(Debug, Clone)]
pub struct CandidateQueue {
    items: VecDeque<IceCandidate>,
    limit: usize,
    dropped: usize,
}

impl CandidateQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            items: VecDeque::new(),
            limit: limit.max(1),
            dropped: 0,
        }
    }

    /// Добавить кандидат; при переполнении выбрасывается самый старый
    pub fn push(&mut self, participant: &ParticipantId, candidate: IceCandidate) {
        if self.items.len() >= self.limit {
            self.items.pop_front();
            self.dropped += 1;
            warn!(
                "Candidate queue for {} is full ({}), dropping oldest",
                participant, self.limit
            );
        }
        self.items.push_back(candidate);
    }

    /// Перенести кандидаты из другой очереди (сироты → соединение)
    pub fn absorb(&mut self, participant: &ParticipantId, other: CandidateQueue) {
        for candidate in other.items {
            self.push(participant, candidate);
        }
    }

    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

/// Тип кандидата из SDP-строки
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
    Unknown,
}

impl CandidateType {
    pub fn of(candidate: &IceCandidate) -> Self {
        let mut parts = candidate.candidate.split_whitespace();
        while let Some(part) = parts.next() {
            if part == "typ" {
                return match parts.next() {
                    Some("host") => CandidateType::Host,
                    Some("srflx") => CandidateType::ServerReflexive,
                    Some("prflx") => CandidateType::PeerReflexive,
                    Some("relay") => CandidateType::Relay,
                    _ => CandidateType::Unknown,
                };
            }
        }
        CandidateType::Unknown
    }
}

/// Сводка по локальным кандидатам соединения
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandidateStats {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
    pub other: usize,
}

impl CandidateStats {
    pub fn record(&mut self, candidate: &IceCandidate) {
        match CandidateType::of(candidate) {
            CandidateType::Host => self.host += 1,
            CandidateType::ServerReflexive => self.srflx += 1,
            CandidateType::Relay => self.relay += 1,
            _ => self.other += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.host + self.srflx + self.relay + self.other
    }

    /// Соединение через NAT, скорее всего, не получится
    pub fn lacks_nat_traversal(&self) -> bool {
        self.srflx == 0 && self.relay == 0
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(c: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: c.username_fragment,
        }
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        IceCandidate {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(typ: &str) -> IceCandidate {
        IceCandidate::new(format!(
            "candidate:842163049 1 udp 1677729535 203.0.113.7 46154 typ {typ} raddr 0.0.0.0 rport 0"
        ))
    }

    #[test]
    fn test_queue_drops_oldest_when_full() {
        let p = ParticipantId::new("b");
        let mut queue = CandidateQueue::new(2);
        queue.push(&p, IceCandidate::new("c1"));
        queue.push(&p, IceCandidate::new("c2"));
        queue.push(&p, IceCandidate::new("c3"));

        assert_eq!(queue.dropped(), 1);
        let drained: Vec<_> = queue.drain().into_iter().map(|c| c.candidate).collect();
        assert_eq!(drained, vec!["c2", "c3"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_absorb_keeps_order() {
        let p = ParticipantId::new("b");
        let mut orphans = CandidateQueue::new(8);
        orphans.push(&p, IceCandidate::new("early"));
        let mut queue = CandidateQueue::new(8);
        queue.absorb(&p, orphans);
        queue.push(&p, IceCandidate::new("late"));
        let drained: Vec<_> = queue.drain().into_iter().map(|c| c.candidate).collect();
        assert_eq!(drained, vec!["early", "late"]);
    }

    #[test]
    fn test_candidate_type_parsing() {
        assert_eq!(CandidateType::of(&cand("host")), CandidateType::Host);
        assert_eq!(CandidateType::of(&cand("srflx")), CandidateType::ServerReflexive);
        assert_eq!(CandidateType::of(&cand("relay")), CandidateType::Relay);
        assert_eq!(CandidateType::of(&IceCandidate::new("garbage")), CandidateType::Unknown);
    }

    #[test]
    fn test_stats_flag_missing_reflexive() {
        let mut stats = CandidateStats::default();
        stats.record(&cand("host"));
        assert!(stats.lacks_nat_traversal());
        stats.record(&cand("srflx"));
        assert!(!stats.lacks_nat_traversal());
        assert_eq!(stats.total(), 2);
    }
}
