use crate::config::{Config, Policy};
use crate::model::{
    CLUSTER_PERIODS, DepositSource, Health, Person, Stats, TestSchedule, deposit,
};
use crate::rng::RngGroup;
use crate::topology::{Computed, Topology};
use crate::trace::LockdownState;
use rand::{Rng, seq::SliceRandom};
use rand_distr::Distribution;
use std::{collections::VecDeque, ops::ControlFlow};

/// Simulation engine for a single run.
///
/// Owns the run's topology, random streams and day counter, and advances
/// them one day (followed by its periods) at a time.
pub struct Engine {
    pub(crate) cfg: Config,
    pub(crate) policy: Policy,
    seed: u64,
    pub(crate) rng: RngGroup,
    pub(crate) topo: Topology,
    pub(crate) computed: Computed,
    pub(crate) day: u32,
    pub(crate) install_base: f64,
    pub(crate) lockdown: LockdownState,
    pub(crate) test_queue: VecDeque<usize>,
    isolated_periods: u32,
    /// Per-day (secondary infections, finished cases) over the last infectious period.
    recent_infections: VecDeque<(u32, u32)>,
    present: Vec<Vec<usize>>,
    scratch: GroupScratch,
}

#[derive(Default)]
struct GroupScratch {
    members: Vec<usize>,
    contagious: Vec<usize>,
    susceptible: Vec<usize>,
    installed: Vec<usize>,
}

impl Engine {
    /// Create an engine with a freshly built topology for `policy` and `seed`.
    pub fn new(cfg: Config, policy: Policy, seed: u64) -> Self {
        let mut rng = RngGroup::new(seed);
        let topo = Topology::build(&cfg, policy, &mut rng);
        let computed = Computed::new(&cfg, policy, &topo);
        log::debug!("initialized {policy} run with seed {seed}: {computed:?}");

        Self {
            present: vec![Vec::new(); topo.clusters.len()],
            install_base: computed.install_base,
            recent_infections: VecDeque::with_capacity(computed.infectious_days),
            cfg,
            policy,
            seed,
            rng,
            topo,
            computed,
            day: 0,
            lockdown: LockdownState::default(),
            test_queue: VecDeque::new(),
            isolated_periods: 0,
            scratch: GroupScratch::default(),
        }
    }

    pub fn day(&self) -> u32 {
        self.day
    }

    pub fn people(&self) -> &[Person] {
        &self.topo.people
    }

    /// Run until the configured number of days, emitting one [`Stats`] per day.
    ///
    /// Stops early if `emit` breaks.
    pub fn run<F>(&mut self, mut emit: F)
    where
        F: FnMut(Stats) -> ControlFlow<()>,
    {
        while self.day < self.cfg.days {
            let stats = self.next_day();
            log::trace!("{} seed {} day {}: {stats:?}", self.policy, self.seed, self.day);
            if emit(stats).is_break() {
                log::debug!("{} seed {} stopped at day {}", self.policy, self.seed, self.day);
                return;
            }
            for _ in 0..CLUSTER_PERIODS {
                self.next_period();
            }
        }
    }

    /// Run to completion and collect every day's [`Stats`].
    pub fn run_to_end(&mut self) -> Vec<Stats> {
        let mut stats_vec = Vec::with_capacity(self.cfg.days as usize);
        self.run(|stats| {
            stats_vec.push(stats);
            ControlFlow::Continue(())
        });
        stats_vec
    }

    /// Advance disease timers, test and trace, and report the day's counts.
    pub fn next_day(&mut self) -> Stats {
        self.day += 1;
        let day = self.day;
        let isolation_end = day + self.cfg.isolation_days;

        let mut active = 0;
        let mut spread_total = 0;
        let mut spread_by = 0;

        for id in 0..self.topo.people.len() {
            if self.topo.people[id].is_dead() {
                continue;
            }

            // Progress infections and spread within the household.
            if self.topo.people[id].is_infected() {
                active += 1;
                if let Some(spread) = self.progress_infection(id, isolation_end) {
                    spread_by += 1;
                    spread_total += spread;
                }
                if self.topo.people[id].status.contagious {
                    self.infect_household(id);
                }
            } else if self.rng.foreign.chance(self.computed.daily_foreign) {
                self.topo.people[id].infect(day, 0, &self.cfg, &mut self.rng);
            }

            let person = &mut self.topo.people[id];
            if person.is_dead() {
                continue;
            }

            // Queue test results that are due. A zero delay set by a tracing
            // pass lands on a day this loop has already visited.
            if matches!(person.test, TestSchedule::On(test_day) if test_day <= day) {
                person.test = TestSchedule::Pending;
                self.test_queue.push_back(id);
            }

            // Expire immunity and isolation.
            if person.status.immune && day >= person.immunity_end_day {
                person.status.immune = false;
            }
            if person.status.isolated && day >= person.isolation_end_day {
                person.release();
            }

            // Prompted people may install the app.
            if person.attrs.prompted_foreign
                && self.rng.install_foreign.chance(self.computed.install_foreign)
            {
                person.attrs.prompted_foreign = false;
                person.install_app(day);
            }
            if person.attrs.prompted_own && self.rng.install_own.chance(self.computed.install_own) {
                person.attrs.prompted_own = false;
                person.install_app(day);
            }
        }

        if self.recent_infections.len() >= self.computed.infectious_days {
            self.recent_infections.pop_front();
        }
        self.recent_infections.push_back((spread_total, spread_by));

        match self.policy {
            Policy::ExposureNotification => self.trace_exposures(isolation_end),
            Policy::ReputationScore => self.trace_scores(isolation_end),
            Policy::FreeMovement | Policy::Lockdown => self.test_and_lockdown(active, isolation_end),
        }

        let stats = self.collect_stats();
        self.install_base = f64::from(stats.installed) / f64::from(self.cfg.population);
        self.isolated_periods = 0;
        stats
    }

    /// Returns the person's spread count if their infection ended today.
    fn progress_infection(&mut self, id: usize, isolation_end: u32) -> Option<u32> {
        let day = self.day;

        let person = &mut self.topo.people[id];
        if !person.status.contagious && day >= person.infected_day + self.cfg.pre_infectious_days
        {
            person.status.contagious = true;
            if person.attrs.symptomatic {
                self.on_symptoms(id, isolation_end);
            }
        }

        let person = &mut self.topo.people[id];
        if day < person.infection_end_day {
            return None;
        }
        let spread = person.spread;
        if self.rng.fatality.chance(self.cfg.fatality_risk) {
            person.die();
        } else {
            person.recover();
        }
        Some(spread)
    }

    fn on_symptoms(&mut self, id: usize, isolation_end: u32) {
        let day = self.day;
        let person = &mut self.topo.people[id];

        if self.rng.isolation_symptomatic.chance(self.cfg.isolation_symptomatic) {
            person.isolate(isolation_end);
        }
        if person.test == TestSchedule::Unscheduled
            && self.rng.test_symptomatic.chance(self.cfg.test_symptomatic)
        {
            person.test = TestSchedule::On(day + self.cfg.test_delay.sample(&mut self.rng.test_delay));
        }
        if self.policy == Policy::ReputationScore
            && person.attrs.app_installed
            && self.rng.self_attestation.chance(self.cfg.self_attestation)
        {
            deposit(&mut self.topo.people, id, DepositSource::SelfAttestation);
        }
        if self.cfg.isolate_household {
            self.isolate_household(id, isolation_end);
        }
    }

    fn infect_household(&mut self, id: usize) {
        let day = self.day;
        let generation = self.topo.people[id].generation + 1;
        for idx in 0..self.topo.people[id].household_contacts.len() {
            let other = self.topo.people[id].household_contacts[idx];
            if !self.topo.people[other].is_susceptible() {
                continue;
            }
            if self.rng.infect.chance(self.cfg.infection_risk) {
                self.topo.people[other].infect(day, generation, &self.cfg, &mut self.rng);
                self.topo.people[id].spread += 1;
                break;
            }
        }
    }

    pub(crate) fn isolate_household(&mut self, id: usize, isolation_end: u32) {
        for idx in 0..self.topo.people[id].household_contacts.len() {
            let other = self.topo.people[id].household_contacts[idx];
            self.topo.people[other].isolate(isolation_end);
        }
    }

    /// Isolate someone who tested positive, along with their household if configured.
    pub(crate) fn isolate_positive(&mut self, id: usize, isolation_end: u32) {
        self.topo.people[id].isolate(isolation_end);
        if self.cfg.isolate_household {
            self.isolate_household(id, isolation_end);
        }
    }

    pub(crate) fn schedule_test(&mut self, id: usize) {
        let delay = self.cfg.test_delay.sample(&mut self.rng.test_delay);
        self.topo.people[id].test = TestSchedule::On(self.day + delay);
    }

    fn collect_stats(&self) -> Stats {
        let lockdown = self.lockdown.active;
        let mut stats = Stats {
            day: self.day,
            healthy: 0,
            infected: 0,
            recovered: 0,
            dead: 0,
            immune: 0,
            isolated: 0,
            installed: 0,
            isolated_periods: f64::from(self.isolated_periods) / f64::from(CLUSTER_PERIODS),
            lockdown,
            r: 0.0,
        };

        for person in &self.topo.people {
            match person.status.health {
                Health::Healthy => stats.healthy += 1,
                Health::Infected => stats.infected += 1,
                Health::Recovered => stats.recovered += 1,
                Health::Dead => stats.dead += 1,
            }
            if person.status.immune {
                stats.immune += 1;
            }
            // Under lockdown everyone but working key workers counts as isolated.
            let isolated = if lockdown {
                !person.is_dead() && (!person.attrs.key_worker || person.status.isolated)
            } else {
                person.status.isolated
            };
            if isolated {
                stats.isolated += 1;
            }
            if person.attrs.app_installed {
                stats.installed += 1;
            }
        }

        let (total, cases) = self
            .recent_infections
            .iter()
            .fold((0, 0), |(total, cases), &(t, c)| (total + t, cases + c));
        if cases > 0 {
            stats.r = f64::from(total) / f64::from(cases);
        }

        stats
    }

    /// Move people into clusters, split them into groups and let them mix.
    pub fn next_period(&mut self) {
        let lockdown = self.lockdown.active;

        for id in 0..self.topo.people.len() {
            let person = &mut self.topo.people[id];
            if person.is_dead() {
                continue;
            }

            // Isolated people stay home unless they break isolation.
            let stays_home = if lockdown {
                (!person.attrs.key_worker || person.status.isolated)
                    && self.rng.isolation_lockdown.chance(self.cfg.isolation_lockdown)
            } else {
                person.status.isolated
                    && self
                        .rng
                        .isolation_effectiveness
                        .chance(self.cfg.isolation_effectiveness)
            };
            if stays_home {
                self.isolated_periods += 1;
                continue;
            }

            let Some(cluster_id) = choose_cluster(
                &mut self.rng,
                &self.cfg,
                &self.topo.public_clusters,
                &self.topo.private_clusters,
                &person.clusters,
            ) else {
                continue;
            };

            if self.policy == Policy::ReputationScore {
                let cluster = &self.topo.clusters[cluster_id];
                if !cluster.gatekept {
                    if person.attrs.app_installed
                        && !self.rng.exposed_visit.chance(self.cfg.exposed_visit)
                    {
                        continue;
                    }
                } else if !person.attrs.app_installed {
                    person.attrs.prompted_foreign = true;
                    continue;
                } else if person.score <= f64::from(self.cfg.gatekept_threshold) {
                    continue;
                }
            }

            self.present[cluster_id].push(id);
        }

        let mut scratch = std::mem::take(&mut self.scratch);
        for cluster_id in 0..self.present.len() {
            let mut visitors = std::mem::take(&mut self.present[cluster_id]);
            while !visitors.is_empty() {
                let size = self.cfg.group_size.sample(&mut self.rng.group_size) as usize;
                let keep = visitors.len().saturating_sub(size);
                scratch.members.clear();
                scratch.members.extend(visitors.drain(keep..).rev());
                scratch.members.shuffle(&mut self.rng.shuffle_group);
                self.mix_group(&mut scratch);
            }
            self.present[cluster_id] = visitors;
        }
        self.scratch = scratch;
    }

    fn mix_group(&mut self, scratch: &mut GroupScratch) {
        let day = self.day;
        let trace = self.policy.uses_app();
        let people = &mut self.topo.people;

        scratch.contagious.clear();
        scratch.susceptible.clear();
        scratch.installed.clear();
        for &id in &scratch.members {
            let person = &people[id];
            if person.status.contagious {
                scratch.contagious.push(id);
            } else if person.is_susceptible() {
                scratch.susceptible.push(id);
            }
            if trace && person.attrs.app_installed {
                scratch.installed.push(id);
            }
        }

        // The first contagious member to pass the roll infects the victim.
        if !scratch.contagious.is_empty() {
            for &victim in &scratch.susceptible {
                for &from in &scratch.contagious {
                    if self.rng.infect.chance(self.cfg.infection_risk) {
                        let generation = people[from].generation + 1;
                        people[victim].infect(day, generation, &self.cfg, &mut self.rng);
                        people[from].spread += 1;
                        break;
                    }
                }
            }
        }

        for &a in &scratch.installed {
            for &b in &scratch.installed {
                if a != b {
                    people[a].record_contact(b);
                }
            }
        }
    }
}

fn choose_cluster(
    rng: &mut RngGroup,
    cfg: &Config,
    public: &[usize],
    private: &[usize],
    own: &[usize],
) -> Option<usize> {
    if rng.visit_foreign_cluster.chance(cfg.visit_foreign_cluster) {
        let (list, pick) = if rng.visit_public_cluster.chance(cfg.visit_public_cluster) {
            (public, &mut rng.select_public_cluster)
        } else {
            (private, &mut rng.select_private_cluster)
        };
        if !list.is_empty() {
            return Some(list[pick.random_range(0..list.len())]);
        }
    }
    if own.is_empty() {
        return None;
    }
    Some(own[rng.select_own_cluster.random_range(0..own.len())])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SMALL;
    use crate::dist::Dist;

    fn engine(policy: Policy, tweak: impl FnOnce(&mut Config)) -> Engine {
        let mut cfg = Config::from_toml(SMALL).expect("config should be valid");
        cfg.foreign_imports = 0.0;
        tweak(&mut cfg);
        Engine::new(cfg, policy, 1)
    }

    #[test]
    fn zero_delay_tests_still_get_processed() {
        let mut engine = engine(Policy::Lockdown, |cfg| {
            cfg.daily_test_capacity = 1.0;
            cfg.test_delay = Dist::Poisson {
                mean: 0.5,
                min: 0,
                max: 0,
            };
        });
        engine.next_day();
        for id in 0..10 {
            engine.schedule_test(id);
        }
        assert!(
            engine.topo.people[..10]
                .iter()
                .all(|p| p.test == TestSchedule::On(1))
        );

        engine.next_day();
        assert!(
            engine
                .people()
                .iter()
                .all(|p| p.test == TestSchedule::Unscheduled)
        );
    }

    /// Everyone has the app, scores `threshold + offset` and finds every
    /// cluster gatekept.
    fn gatekept_engine(offset: f64) -> Engine {
        let mut engine = engine(Policy::ReputationScore, |cfg| {
            cfg.visit_foreign_cluster = 0.0;
        });
        let score = f64::from(engine.cfg.gatekept_threshold) + offset;
        for cluster in &mut engine.topo.clusters {
            cluster.gatekept = true;
        }
        for person in &mut engine.topo.people {
            person.attrs.app_installed = true;
            person.attrs.prompted_foreign = false;
            person.score = score;
            person.contacts.advance(Vec::clear);
        }
        engine
    }

    fn anyone_met(engine: &Engine) -> bool {
        engine
            .people()
            .iter()
            .any(|p| p.contacts.iter().any(|slot| !slot.is_empty()))
    }

    #[test]
    fn gatekept_clusters_turn_away_low_scores() {
        let mut engine = gatekept_engine(0.0);
        engine.next_period();
        assert!(!anyone_met(&engine));

        let mut engine = gatekept_engine(1.0);
        engine.next_period();
        assert!(anyone_met(&engine));
    }

    #[test]
    fn gatekept_clusters_prompt_visitors_without_the_app() {
        let mut engine = gatekept_engine(50.0);
        engine.topo.people[0].attrs.app_installed = false;
        engine.next_period();

        let person = &engine.topo.people[0];
        assert!(person.attrs.prompted_foreign);
        assert!(person.contacts.iter().all(Vec::is_empty));
        assert!(
            engine.topo.people[1..]
                .iter()
                .all(|p| !p.attrs.prompted_foreign)
        );
    }
}
