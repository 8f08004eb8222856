//! Координатор согласования: кто делает offer, последовательность обмена,
//! очередь повторных согласований и разрешение встречных offer.
//!
//! Модуль не выполняет ввода-вывода; он только решает, что делать дальше.

use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Undetermined,
    Caller,
    Answeree,
}

/// Разрешение коллизии по идентификаторам соединений сигнального канала.
///
/// Применяется, только когда роли не различают стороны (обе считают себя
/// caller после двойного `user-joined`). Сторона с лексикографически меньшим
/// идентификатором держит роль offerer. Равные идентификаторы означают, что
/// это одно и то же соединение; тогда выигрыш не засчитывается никому.
pub fn preferred_offerer(local_id: &str, remote_id: &str) -> bool {
    local_id.cmp(remote_id) == Ordering::Less
}

/// Запрос на создание offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OfferRequest {
    pub ice_restart: bool,
}

impl OfferRequest {
    pub fn restart() -> Self {
        Self { ice_restart: true }
    }

    fn merge(self, other: OfferRequest) -> Self {
        Self {
            ice_restart: self.ice_restart || other.ice_restart,
        }
    }
}

/// Offer, который сейчас в работе. `seq` связывает результат создания с запросом
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferTicket {
    pub seq: u64,
    pub ice_restart: bool,
}

/// Что делать с пришедшим offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferDisposition {
    /// Применить; при `rollback` сначала откатить собственный offer
    Accept { rollback: bool },
    /// Мы выигрываем коллизию, чужой offer отбрасывается
    Ignore,
}

#[derive(Debug)]
pub struct Negotiator {
    local_id: Option<String>,
    remote_id: Option<String>,
    role: CallRole,
    /// Наш offer уже хотя бы раз получил answer от текущего собеседника
    established: bool,
    timer: Option<u64>,
    next_generation: u64,
    in_flight: Option<OfferTicket>,
    queued: Option<OfferRequest>,
    next_seq: u64,
}

impl Default for Negotiator {
    fn default() -> Self {
        Self::new()
    }
}

impl Negotiator {
    pub fn new() -> Self {
        Self {
            local_id: None,
            remote_id: None,
            role: CallRole::Undetermined,
            established: false,
            timer: None,
            next_generation: 0,
            in_flight: None,
            queued: None,
            next_seq: 0,
        }
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn local_id(&self) -> Option<&str> {
        self.local_id.as_deref()
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    pub fn set_local_id(&mut self, id: impl Into<String>) {
        self.local_id = Some(id.into());
    }

    pub fn in_flight(&self) -> Option<OfferTicket> {
        self.in_flight
    }

    pub fn has_queued(&self) -> bool {
        self.queued.is_some()
    }

    pub fn offer_timer_pending(&self) -> bool {
        self.timer.is_some()
    }

    /// Участник, который уже в комнате, видит `user-joined` второго и становится
    /// caller. Возвращает поколение таймера отложенного offer.
    pub fn peer_joined(&mut self, remote_id: &str) -> Option<u64> {
        if self.local_id.as_deref() == Some(remote_id) {
            return None;
        }
        if self.remote_id.as_deref() == Some(remote_id) {
            // дубликат события для того же собеседника
            return None;
        }
        self.remote_id = Some(remote_id.to_owned());
        self.role = CallRole::Caller;
        self.next_generation += 1;
        self.timer = Some(self.next_generation);
        Some(self.next_generation)
    }

    /// Собеседник ушёл: всё, что было начато для него, отменяется
    pub fn peer_left(&mut self, remote_id: &str) -> bool {
        match self.remote_id.as_deref() {
            Some(current) if current != remote_id => false,
            _ => {
                self.remote_id = None;
                self.role = CallRole::Undetermined;
                self.established = false;
                self.timer = None;
                self.in_flight = None;
                self.queued = None;
                true
            }
        }
    }

    /// Сработал таймер отложенного offer
    pub fn offer_timer_fired(&mut self, generation: u64) -> Option<OfferTicket> {
        if self.timer != Some(generation) {
            return None;
        }
        self.timer = None;
        if self.role != CallRole::Caller {
            return None;
        }
        self.request(OfferRequest::default())
    }

    /// Не больше одного offer в работе: новый запрос ставится в очередь
    pub fn request(&mut self, request: OfferRequest) -> Option<OfferTicket> {
        if self.in_flight.is_some() {
            self.queued = Some(match self.queued {
                Some(queued) => queued.merge(request),
                None => request,
            });
            return None;
        }
        self.next_seq += 1;
        let ticket = OfferTicket {
            seq: self.next_seq,
            ice_restart: request.ice_restart,
        };
        self.in_flight = Some(ticket);
        Some(ticket)
    }

    /// Актуален ли созданный offer (не был ли он отброшен коллизией)
    pub fn is_current(&self, seq: u64) -> bool {
        self.in_flight.map(|t| t.seq) == Some(seq)
    }

    pub fn expects_answer(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Создание offer не удалось; следующий запрос из очереди идёт в работу
    pub fn offer_failed(&mut self, seq: u64) -> Option<OfferTicket> {
        if !self.is_current(seq) {
            return None;
        }
        self.in_flight = None;
        self.next_queued()
    }

    /// Ответ на наш offer применён; обмен завершён
    pub fn answer_applied(&mut self) -> Option<OfferTicket> {
        self.in_flight = None;
        if self.role == CallRole::Caller {
            self.established = true;
        }
        self.next_queued()
    }

    /// Мы отправили answer на чужой offer; отложенные запросы можно выпускать
    pub fn answer_sent(&mut self) -> Option<OfferTicket> {
        if self.in_flight.is_some() {
            return None;
        }
        self.next_queued()
    }

    /// Обмен сорвался с ошибкой: незавершённый offer и очередь сбрасываются
    pub fn abandon(&mut self) {
        self.in_flight = None;
        self.queued = None;
    }

    fn next_queued(&mut self) -> Option<OfferTicket> {
        let request = self.queued.take()?;
        self.request(request)
    }

    /// Пришёл offer от собеседника
    pub fn remote_offer(&mut self, from: Option<&str>) -> OfferDisposition {
        if let Some(from) = from {
            if self.remote_id.is_none() {
                self.remote_id = Some(from.to_owned());
            }
        }

        let contending = self.in_flight.is_some() || self.timer.is_some();
        if !contending {
            if self.role == CallRole::Undetermined {
                self.role = CallRole::Answeree;
            }
            return OfferDisposition::Accept { rollback: false };
        }

        if self.wins_collision(from) {
            if !self.established {
                self.role = CallRole::Caller;
            }
            return OfferDisposition::Ignore;
        }

        let rollback = self.in_flight.is_some();
        self.in_flight = None;
        self.timer = None;
        if !self.established {
            self.role = CallRole::Answeree;
        }
        OfferDisposition::Accept { rollback }
    }

    /// Роль offerer всегда выигрывает. Идентификаторы сравниваются, только
    /// пока звонок не установлен и роль caller может быть у обеих сторон.
    fn wins_collision(&self, from: Option<&str>) -> bool {
        match self.role {
            CallRole::Answeree => return false,
            CallRole::Caller if self.established => return true,
            _ => {}
        }
        let remote = from.or(self.remote_id.as_deref());
        match (self.local_id.as_deref(), remote) {
            (Some(local), Some(remote)) => preferred_offerer(local, remote),
            // без идентификаторов решает текущая роль
            _ => self.role == CallRole::Caller,
        }
    }
}
