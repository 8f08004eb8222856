use crate::peer::types::{IceCandidate, IceConnectionState};

/// Кандидаты, полученные до установки remote description.
///
/// Очередь опустошается ровно один раз, сразу после первого успешного
/// применения remote description; после этого кандидаты применяются сразу.
#[derive(Debug, Default)]
pub struct PendingCandidates {
    queue: Vec<IceCandidate>,
    drained: bool,
}

impl PendingCandidates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Возвращает кандидат обратно, если его можно применять немедленно
    pub fn offer(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.drained {
            Some(candidate)
        } else {
            self.queue.push(candidate);
            None
        }
    }

    /// Забирает накопленные кандидаты в порядке поступления.
    /// Повторный вызов всегда возвращает пустой список.
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        if self.drained {
            return Vec::new();
        }
        self.drained = true;
        std::mem::take(&mut self.queue)
    }

    pub fn is_drained(&self) -> bool {
        self.drained
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Не даёт повторять ICE restart, пока не закончился текущий эпизод отказа.
///
/// Эпизод начинается с первого `failed` и заканчивается, когда ICE снова
/// доходит до `connected`/`completed`.
#[derive(Debug, Default)]
pub struct RestartGuard {
    in_episode: bool,
    restarts: u32,
}

impl RestartGuard {
    /// `true`, если нужно выпустить restart-offer
    pub fn observe(&mut self, state: IceConnectionState) -> bool {
        match state {
            IceConnectionState::Failed if !self.in_episode => {
                self.in_episode = true;
                self.restarts += 1;
                true
            }
            IceConnectionState::Connected | IceConnectionState::Completed => {
                self.in_episode = false;
                false
            }
            _ => false,
        }
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn in_episode(&self) -> bool {
        self.in_episode
    }
}

/// Сводка по типам кандидатов для диагностики
pub fn analyze_candidates(candidates: &[IceCandidate]) -> String {
    use crate::peer::types::CandidateKind;

    let mut host_count = 0;
    let mut srflx_count = 0;
    let mut relay_count = 0;

    for candidate in candidates {
        match candidate.kind() {
            CandidateKind::Host => host_count += 1,
            CandidateKind::ServerReflexive | CandidateKind::PeerReflexive => srflx_count += 1,
            CandidateKind::Relay => relay_count += 1,
            CandidateKind::Unknown => {}
        }
    }

    format!(
        "Candidate analysis: {} host, {} srflx, {} relay",
        host_count, srflx_count, relay_count
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host"))
    }

    #[test]
    fn buffers_until_drained_then_passes_through() {
        let mut pending = PendingCandidates::new();
        assert!(pending.offer(cand(1)).is_none());
        assert!(pending.offer(cand(2)).is_none());
        assert_eq!(pending.len(), 2);

        let drained = pending.drain();
        assert_eq!(drained, vec![cand(1), cand(2)]);
        assert!(pending.is_empty());
        assert!(pending.is_drained());

        assert_eq!(pending.offer(cand(3)), Some(cand(3)));
        assert!(pending.is_empty());
        assert!(pending.drain().is_empty());
    }

    #[test]
    fn restart_once_per_failure_episode() {
        let mut guard = RestartGuard::default();
        assert!(!guard.observe(IceConnectionState::Checking));
        assert!(guard.observe(IceConnectionState::Failed));
        assert!(!guard.observe(IceConnectionState::Failed));
        assert!(!guard.observe(IceConnectionState::Checking));
        assert!(!guard.observe(IceConnectionState::Failed));
        assert_eq!(guard.restarts(), 1);

        assert!(!guard.observe(IceConnectionState::Connected));
        assert!(!guard.in_episode());
        assert!(!guard.observe(IceConnectionState::Disconnected));
        assert!(guard.observe(IceConnectionState::Failed));
        assert_eq!(guard.restarts(), 2);
    }

    #[test]
    fn analysis_counts_by_type() {
        let list = vec![
            cand(1),
            IceCandidate::new("candidate:5 1 udp 1 1.2.3.4 3478 typ relay"),
        ];
        assert_eq!(
            analyze_candidates(&list),
            "Candidate analysis: 1 host, 0 srflx, 1 relay"
        );
    }
}
