use crate::config::Config;
use crate::rng::RngGroup;
use rand_distr::Distribution;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Number of intraday periods.
pub const CLUSTER_PERIODS: u32 = 8;

/// Primary, mutually exclusive health state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Infected,
    Recovered,
    Dead,
}

#[derive(Clone, Copy, Debug)]
pub struct Status {
    pub health: Health,
    pub contagious: bool,
    pub immune: bool,
    pub isolated: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Attrs {
    pub app_installed: bool,
    /// Declined the app when one of their own clusters became gatekept.
    pub prompted_own: bool,
    /// Turned away from a gatekept cluster for lacking the app.
    pub prompted_foreign: bool,
    pub key_worker: bool,
    pub symptomatic: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestSchedule {
    Unscheduled,
    On(u32),
    /// Queued for a result.
    Pending,
}

/// Which half of a token account a deposit lands in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DepositSource {
    OfficialTest,
    SelfAttestation,
}

/// One day of exposure deposits, indexed by degree (self, first, second).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TokenAccount {
    pub official: [u32; 3],
    pub attested: [u32; 3],
}

impl TokenAccount {
    fn add(&mut self, source: DepositSource, depth: usize) {
        match source {
            DepositSource::OfficialTest => self.official[depth] += 1,
            DepositSource::SelfAttestation => self.attested[depth] += 1,
        }
    }
}

/// Fixed-length window of daily slots.
///
/// Advancing drops the oldest slot once the window is full and reuses it,
/// cleared, as the fresh current slot.
#[derive(Clone, Debug)]
pub struct RollingWindow<T> {
    slots: VecDeque<T>,
    len: usize,
}

impl<T: Default> RollingWindow<T> {
    pub fn new(len: usize) -> Self {
        let len = len.max(1);
        Self {
            slots: VecDeque::with_capacity(len),
            len,
        }
    }

    pub fn advance(&mut self, clear: impl FnOnce(&mut T)) {
        if self.slots.len() >= self.len {
            if let Some(mut oldest) = self.slots.pop_front() {
                clear(&mut oldest);
                self.slots.push_back(oldest);
                return;
            }
        }
        self.slots.push_back(T::default());
    }

    pub fn current_mut(&mut self) -> Option<&mut T> {
        self.slots.back_mut()
    }

    pub fn current(&self) -> Option<&T> {
        self.slots.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct Person {
    pub id: usize,
    pub attrs: Attrs,
    pub status: Status,

    pub infected_day: u32,
    pub infection_end_day: u32,
    pub immunity_end_day: u32,
    pub isolation_end_day: u32,
    pub install_day: u32,
    pub test: TestSchedule,

    pub household: usize,
    pub household_contacts: Vec<usize>,
    /// Clusters the person may visit; the first is their primary cluster.
    pub clusters: Vec<usize>,
    /// Ids met per day while the app was installed.
    pub contacts: RollingWindow<Vec<usize>>,
    pub tokens: RollingWindow<TokenAccount>,

    pub score: f64,
    /// Number of people this person infected during the current infection.
    pub spread: u32,
    pub generation: u32,
}

impl Person {
    pub fn new(id: usize, attrs: Attrs, trace_days: usize) -> Self {
        Self {
            id,
            attrs,
            status: Status {
                health: Health::Healthy,
                contagious: false,
                immune: false,
                isolated: false,
            },
            infected_day: 0,
            infection_end_day: 0,
            immunity_end_day: 0,
            isolation_end_day: 0,
            install_day: 0,
            test: TestSchedule::Unscheduled,
            household: 0,
            household_contacts: Vec::new(),
            clusters: Vec::new(),
            contacts: RollingWindow::new(trace_days),
            tokens: RollingWindow::new(trace_days),
            score: 0.0,
            spread: 0,
            generation: 0,
        }
    }

    pub fn is_dead(&self) -> bool {
        self.status.health == Health::Dead
    }

    pub fn is_infected(&self) -> bool {
        self.status.health == Health::Infected
    }

    /// Not infected and not immune.
    pub fn is_susceptible(&self) -> bool {
        matches!(self.status.health, Health::Healthy | Health::Recovered) && !self.status.immune
    }

    /// Infect the person on `day`, sampling illness and immunity durations.
    ///
    /// Returns `false` without side effects if the person is already
    /// infected, immune or dead.
    pub fn infect(&mut self, day: u32, generation: u32, cfg: &Config, rng: &mut RngGroup) -> bool {
        if !self.is_susceptible() {
            return false;
        }
        self.generation = generation;
        self.infected_day = day;
        self.infection_end_day = day
            + cfg.pre_infectious_days
            + cfg.pre_symptomatic_infectious_days
            + cfg.illness.sample(&mut rng.illness);
        self.immunity_end_day = self.infection_end_day + cfg.immunity.sample(&mut rng.immunity);
        self.spread = 0;
        self.status.health = Health::Infected;
        true
    }

    /// Isolate until `end_day`, replacing any earlier end day.
    pub fn isolate(&mut self, end_day: u32) {
        if self.is_dead() {
            return;
        }
        self.isolation_end_day = end_day;
        self.status.isolated = true;
    }

    pub fn release(&mut self) {
        self.status.isolated = false;
        self.isolation_end_day = 0;
    }

    /// Returns `false` if the app was already installed.
    pub fn install_app(&mut self, day: u32) -> bool {
        if self.attrs.app_installed {
            return false;
        }
        self.attrs.app_installed = true;
        self.install_day = day;
        self.tokens.advance(|account| *account = TokenAccount::default());
        true
    }

    pub fn recover(&mut self) {
        self.status.health = Health::Recovered;
        self.status.contagious = false;
        self.status.immune = true;
    }

    pub fn die(&mut self) {
        self.status = Status {
            health: Health::Dead,
            contagious: false,
            immune: false,
            isolated: false,
        };
    }

    /// Reset the token history to a single empty account.
    pub fn clear_tokens(&mut self) {
        self.tokens.clear();
        self.tokens.advance(|account| *account = TokenAccount::default());
    }

    pub fn record_contact(&mut self, other: usize) {
        if let Some(slot) = self.contacts.current_mut() {
            slot.push(other);
        }
    }
}

/// Deposit exposure tokens from `origin` outwards through the contact journals.
///
/// The origin gets a self deposit, its contacts a first-degree deposit and
/// their contacts a second-degree one. Each hop skips the person it came from.
/// Dead people neither take deposits nor pass them on.
pub fn deposit(people: &mut [Person], origin: usize, source: DepositSource) {
    let mut stack = vec![(origin, None, 0)];
    while let Some((id, from, depth)) = stack.pop() {
        let person = &mut people[id];
        if person.is_dead() {
            continue;
        }
        if let Some(account) = person.tokens.current_mut() {
            account.add(source, depth);
        }
        if depth == 2 {
            continue;
        }
        for &contact in people[id].contacts.iter().flatten() {
            if Some(contact) != from {
                stack.push((contact, Some(id), depth + 1));
            }
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Cluster {
    pub members: Vec<usize>,
    pub public: bool,
    pub gatekept: bool,
}

/// Population counts at the end of a day.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    /// Day index, starting at 1.
    pub day: u32,
    pub healthy: u32,
    pub infected: u32,
    pub recovered: u32,
    pub dead: u32,
    pub immune: u32,
    pub isolated: u32,
    pub installed: u32,
    /// Person-periods spent isolated, in days.
    pub isolated_periods: f64,
    pub lockdown: bool,
    /// Mean secondary infections of recently finished cases.
    pub r: f64,
}
