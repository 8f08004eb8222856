//! Качество соединения по данным getStats.

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum QualityBucket {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl QualityBucket {
    /// Монотонная функция RTT (мс): чем больше задержка, тем хуже корзина
    pub fn from_rtt_ms(rtt_ms: f64) -> Self {
        if rtt_ms < 150.0 {
            QualityBucket::Excellent
        } else if rtt_ms < 300.0 {
            QualityBucket::Good
        } else if rtt_ms < 500.0 {
            QualityBucket::Fair
        } else {
            QualityBucket::Poor
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct InboundVideo {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frames_per_second: Option<f64>,
}

/// Сырые данные одного опроса статистики транспорта
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StatsSnapshot {
    /// RTT выбранной пары кандидатов, секунды
    pub round_trip_time: Option<f64>,
    pub inbound_video: Option<InboundVideo>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkQuality {
    pub rtt_ms: f64,
    pub quality: QualityBucket,
}

/// Производная выборка; заменяется следующей
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualitySample {
    pub taken_at: DateTime<Utc>,
    pub network: Option<NetworkQuality>,
    pub video: Option<InboundVideo>,
}

impl QualitySample {
    pub fn from_snapshot(snapshot: &StatsSnapshot) -> Self {
        let network = snapshot
            .round_trip_time
            .filter(|rtt| rtt.is_finite() && *rtt >= 0.0)
            .map(|rtt| {
                let rtt_ms = rtt * 1000.0;
                NetworkQuality {
                    rtt_ms,
                    quality: QualityBucket::from_rtt_ms(rtt_ms),
                }
            });
        Self {
            taken_at: Utc::now(),
            network,
            video: snapshot.inbound_video,
        }
    }
}

/// Состояние опроса: активен только в `connected`.
///
/// Каждый запуск открывает новый эпизод; результат запроса, выпущенного в
/// прошлом эпизоде, отбрасывается и не снимает флаг текущего запроса.
#[derive(Debug, Default)]
pub struct Sampler {
    active: bool,
    episode: u64,
    in_flight: bool,
    samples: u64,
    failures: u64,
}

impl Sampler {
    /// `true`, если опрос нужно запустить
    pub fn start(&mut self) -> bool {
        if self.active {
            return false;
        }
        self.active = true;
        self.episode += 1;
        self.in_flight = false;
        true
    }

    /// `true`, если опрос был активен
    pub fn stop(&mut self) -> bool {
        let was_active = self.active;
        self.active = false;
        self.in_flight = false;
        was_active
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn episode(&self) -> u64 {
        self.episode
    }

    /// Тик таймера: эпизод, под которым запрашивать статистику. Пока
    /// предыдущий запрос не вернулся, новый не отправляется.
    pub fn tick(&mut self) -> Option<u64> {
        if !self.active || self.in_flight {
            return None;
        }
        self.in_flight = true;
        Some(self.episode)
    }

    /// Результат опроса; `None`, если выборку нужно отбросить
    pub fn complete(
        &mut self,
        episode: u64,
        snapshot: Result<StatsSnapshot, String>,
    ) -> Option<Result<QualitySample, String>> {
        if !self.active || episode != self.episode {
            return None;
        }
        self.in_flight = false;
        match snapshot {
            Ok(snapshot) => {
                self.samples += 1;
                Some(Ok(QualitySample::from_snapshot(&snapshot)))
            }
            Err(e) => {
                self.failures += 1;
                Some(Err(e))
            }
        }
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_follow_rtt_thresholds() {
        assert_eq!(QualityBucket::from_rtt_ms(100.0), QualityBucket::Excellent);
        assert_eq!(QualityBucket::from_rtt_ms(250.0), QualityBucket::Good);
        assert_eq!(QualityBucket::from_rtt_ms(450.0), QualityBucket::Fair);
        assert_eq!(QualityBucket::from_rtt_ms(600.0), QualityBucket::Poor);

        assert_eq!(QualityBucket::from_rtt_ms(149.9), QualityBucket::Excellent);
        assert_eq!(QualityBucket::from_rtt_ms(150.0), QualityBucket::Good);
        assert_eq!(QualityBucket::from_rtt_ms(500.0), QualityBucket::Poor);
    }

    #[test]
    fn bucket_is_monotonic_in_rtt() {
        let mut previous = QualityBucket::Excellent;
        for rtt in (0..2000).step_by(7) {
            let bucket = QualityBucket::from_rtt_ms(rtt as f64);
            assert!(bucket >= previous, "rtt {rtt} went from {previous:?} to {bucket:?}");
            previous = bucket;
        }
    }

    #[test]
    fn sample_converts_seconds_to_millis() {
        let sample = QualitySample::from_snapshot(&StatsSnapshot {
            round_trip_time: Some(0.25),
            inbound_video: Some(InboundVideo {
                width: Some(1280),
                height: Some(720),
                frames_per_second: Some(30.0),
            }),
        });
        let network = sample.network.unwrap();
        assert_eq!(network.rtt_ms, 250.0);
        assert_eq!(network.quality, QualityBucket::Good);
        assert_eq!(sample.video.unwrap().width, Some(1280));

        let empty = QualitySample::from_snapshot(&StatsSnapshot::default());
        assert!(empty.network.is_none());
        assert!(empty.video.is_none());
    }

    #[test]
    fn sampler_only_ticks_while_active_and_skips_overlaps() {
        let mut sampler = Sampler::default();
        assert!(sampler.tick().is_none());
        assert!(sampler.start());
        assert!(!sampler.start());
        let episode = sampler.tick().unwrap();
        assert!(sampler.tick().is_none());

        assert!(matches!(
            sampler.complete(episode, Err("boom".into())),
            Some(Err(_))
        ));
        assert_eq!(sampler.failures(), 1);
        assert!(sampler.tick().is_some(), "a failed tick does not pause the interval");
        assert!(matches!(
            sampler.complete(episode, Ok(StatsSnapshot::default())),
            Some(Ok(_))
        ));

        sampler.tick().unwrap();
        assert!(sampler.stop());
        assert!(sampler.complete(episode, Ok(StatsSnapshot::default())).is_none());
        assert_eq!(sampler.samples(), 1);
    }

    #[test]
    fn results_from_a_previous_episode_are_dropped() {
        let mut sampler = Sampler::default();
        sampler.start();
        let stale = sampler.tick().unwrap();

        // disconnected -> connected, пока старый запрос ещё в пути
        sampler.stop();
        sampler.start();
        let current = sampler.tick().unwrap();
        assert_ne!(stale, current);

        assert!(sampler.complete(stale, Ok(StatsSnapshot::default())).is_none());
        assert!(sampler.tick().is_none(), "the current request is still in flight");
        assert!(sampler
            .complete(current, Ok(StatsSnapshot::default()))
            .is_some());
        assert_eq!(sampler.samples(), 1);
        assert!(sampler.tick().is_some());
    }
}
