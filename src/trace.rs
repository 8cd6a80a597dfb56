use crate::config::Policy;
use crate::engine::Engine;
use crate::model::{DepositSource, RollingWindow, TestSchedule, TokenAccount, deposit};

/// Lockdown switch with hysteresis.
#[derive(Clone, Copy, Debug, Default)]
pub struct LockdownState {
    pub active: bool,
    /// Consecutive days below the end threshold.
    pub ease: u32,
}

impl LockdownState {
    /// Enter once `infected` reaches `start`; leave after `window`
    /// consecutive days below `end`.
    pub fn update(&mut self, infected: u32, start: u32, end: u32, window: u32) {
        if self.active {
            if infected < end {
                self.ease += 1;
                if self.ease >= window {
                    self.active = false;
                    self.ease = 0;
                }
            } else {
                self.ease = 0;
            }
        } else if infected >= start {
            self.active = true;
        }
    }
}

/// Score from the retained token accounts, before any inactivity penalty.
///
/// Self-attested deposits only count once an official deposit has already
/// lowered the score.
pub fn reputation_score(tokens: &RollingWindow<TokenAccount>, second_degree: f64) -> f64 {
    let weights = [100.0, 50.0, second_degree];
    let mut score = 100.0;
    let mut attested = 0.0;
    for account in tokens.iter() {
        for depth in 0..3 {
            score -= f64::from(account.official[depth]) * weights[depth];
            attested += f64::from(account.attested[depth]) * weights[depth];
        }
    }
    if score < 100.0 {
        score -= attested;
    }
    score
}

/// Weight of a second-degree deposit, growing as adoption and testing shrink.
pub fn second_degree_weight(weight: f64, install_base: f64, daily_test_capacity: f64) -> f64 {
    let contact_likelihood = install_base * install_base;
    let amplification = 10.0 / (contact_likelihood * contact_likelihood * daily_test_capacity);
    weight * amplification.min(50.0)
}

impl Engine {
    /// Exposure notification: positives alert everyone in their contact journal.
    pub(crate) fn trace_exposures(&mut self, isolation_end: u32) {
        let mut seen = vec![false; self.topo.people.len()];

        for _ in 0..self.computed.daily_tests {
            let Some(id) = self.test_queue.pop_front() else {
                break;
            };
            let person = &self.topo.people[id];
            if person.is_dead() {
                continue;
            }
            if person.is_infected() {
                let installed = person.attrs.app_installed;
                self.isolate_positive(id, isolation_end);
                if installed {
                    self.notify_contacts(id, isolation_end, &mut seen);
                }
            } else if person.status.isolated {
                self.topo.people[id].release();
            }
            self.topo.people[id].test = TestSchedule::Unscheduled;
        }

        for person in &mut self.topo.people {
            if !person.is_dead() && person.attrs.app_installed {
                person.contacts.advance(Vec::clear);
            }
        }
    }

    fn notify_contacts(&mut self, id: usize, isolation_end: u32, seen: &mut [bool]) {
        let contacts: Vec<usize> = self.topo.people[id]
            .contacts
            .iter()
            .flatten()
            .copied()
            .collect();
        for contact in contacts {
            if seen[contact] {
                continue;
            }
            seen[contact] = true;
            if self.topo.people[contact].test == TestSchedule::Unscheduled
                && self.rng.test_notified.chance(self.cfg.test_notified)
            {
                self.schedule_test(contact);
            }
            if self.rng.isolation_likelihood.chance(self.cfg.isolation_likelihood) {
                self.topo.people[contact].isolate(isolation_end);
            }
        }
    }

    /// Reputation scores: positives deposit tokens through the contact graph
    /// and everyone with the app gets a fresh score.
    pub(crate) fn trace_scores(&mut self, isolation_end: u32) {
        for _ in 0..self.computed.daily_tests {
            let Some(id) = self.test_queue.pop_front() else {
                break;
            };
            let person = &self.topo.people[id];
            if person.is_dead() {
                continue;
            }
            if person.is_infected() {
                let installed = person.attrs.app_installed;
                self.isolate_positive(id, isolation_end);
                if installed {
                    deposit(&mut self.topo.people, id, DepositSource::OfficialTest);
                }
            } else {
                let person = &mut self.topo.people[id];
                person.clear_tokens();
                if person.status.isolated {
                    person.release();
                }
            }
            self.topo.people[id].test = TestSchedule::Unscheduled;
        }

        let day = self.day;
        let trace_days = self.computed.trace_days;
        let second_degree = second_degree_weight(
            self.cfg.second_degree_weight,
            self.install_base,
            self.cfg.daily_test_capacity,
        );
        let isolation_threshold = f64::from(self.cfg.isolation_threshold);

        for id in 0..self.topo.people.len() {
            let person = &mut self.topo.people[id];
            if person.is_dead() || !person.attrs.app_installed {
                continue;
            }

            let mut score = reputation_score(&person.tokens, second_degree);
            let active = day.saturating_sub(person.install_day);
            if active < trace_days {
                score -= f64::from(trace_days - active) * self.computed.inactivity_penalty;
            }
            person.score = score;

            // A recent first-degree official deposit prompts isolation and a test.
            let recent_first = person
                .tokens
                .current()
                .is_some_and(|account| account.official[1] > 0);
            if recent_first && score <= isolation_threshold {
                if self.rng.isolation_likelihood.chance(self.cfg.isolation_likelihood) {
                    person.isolate(isolation_end);
                }
                if person.test == TestSchedule::Unscheduled
                    && self.rng.test_notified.chance(self.cfg.test_notified)
                {
                    self.schedule_test(id);
                }
            }

            let person = &mut self.topo.people[id];
            person.contacts.advance(Vec::clear);
            person.tokens.advance(|account| *account = TokenAccount::default());
        }
    }

    /// Plain testing for the policies without an app, plus lockdown switching.
    pub(crate) fn test_and_lockdown(&mut self, infected: u32, isolation_end: u32) {
        for _ in 0..self.computed.daily_tests {
            let Some(id) = self.test_queue.pop_front() else {
                break;
            };
            if self.topo.people[id].is_dead() {
                continue;
            }
            if self.topo.people[id].is_infected() {
                self.isolate_positive(id, isolation_end);
            }
            self.topo.people[id].test = TestSchedule::Unscheduled;
        }

        if self.policy == Policy::Lockdown {
            let was_active = self.lockdown.active;
            self.lockdown.update(
                infected,
                self.cfg.lockdown_start,
                self.cfg.lockdown_end,
                self.cfg.lockdown_end_window,
            );
            if self.lockdown.active != was_active {
                log::debug!(
                    "lockdown {} on day {} with {infected} infected",
                    if self.lockdown.active { "started" } else { "ended" },
                    self.day
                );
            }
        }

        if self.lockdown.active && self.cfg.test_key_workers {
            for id in 0..self.topo.people.len() {
                let person = &self.topo.people[id];
                if person.attrs.key_worker
                    && !person.is_dead()
                    && person.test == TestSchedule::Unscheduled
                    && self.rng.test_key_worker.chance(self.cfg.test_key_worker)
                {
                    self.schedule_test(id);
                }
            }
        }
    }
}
