use crate::config::{Config, Policy};
use crate::model::{Attrs, Cluster, Person};
use crate::rng::RngGroup;
use rand::{Rng, seq::SliceRandom};
use rand_distr::Distribution;

/// Days of contact and token history kept by the app-based policies.
pub const TRACE_DAYS: u32 = 14;

/// Contact structure of a run: people, households and clusters.
pub struct Topology {
    pub people: Vec<Person>,
    pub households: Vec<Vec<usize>>,
    pub clusters: Vec<Cluster>,
    pub public_clusters: Vec<usize>,
    pub private_clusters: Vec<usize>,
}

/// Constants derived once per run from the config and the initial topology.
#[derive(Clone, Debug)]
pub struct Computed {
    /// Per-person daily probability of an imported infection.
    pub daily_foreign: f64,
    /// Test results processed per day.
    pub daily_tests: usize,
    pub trace_days: u32,
    /// Score penalty per day of missing app history.
    pub inactivity_penalty: f64,
    /// Length of the window used for the reproduction number estimate.
    pub infectious_days: usize,
    /// Per-day install probability after being turned away from a gatekept cluster.
    pub install_foreign: f64,
    /// Per-day install probability after declining at one's own gatekept cluster.
    pub install_own: f64,
    /// Initial fraction of the population with the app.
    pub install_base: f64,
}

impl Topology {
    pub fn build(cfg: &Config, policy: Policy, rng: &mut RngGroup) -> Self {
        let population = cfg.population as usize;
        let trace_days = trace_days(policy) as usize;

        // Roll individual attributes.
        let adoption = match policy {
            Policy::ExposureNotification => cfg.exposure_app_installed,
            Policy::ReputationScore => cfg.score_app_installed,
            Policy::FreeMovement | Policy::Lockdown => 0.0,
        };
        let mut people = Vec::with_capacity(population);
        for id in 0..population {
            let install = rng.app_installed.chance(adoption);
            let attrs = Attrs {
                key_worker: rng.key_worker.chance(cfg.key_workers),
                symptomatic: rng.symptomatic.chance(cfg.symptomatic),
                ..Attrs::default()
            };
            let mut person = Person::new(id, attrs, trace_days);
            if install {
                person.install_app(0);
            }
            if rng.vaccinated.chance(cfg.vaccinated) {
                person.immunity_end_day = cfg.days + 1;
                person.status.immune = true;
            }
            people.push(person);
        }

        let households = build_households(cfg, rng, &mut people);

        let (clusters, public_clusters, private_clusters) =
            build_clusters(cfg, rng, &mut people);

        let mut topo = Self {
            people,
            households,
            clusters,
            public_clusters,
            private_clusters,
        };

        match policy {
            Policy::ReputationScore => {
                topo.gatekeep_clusters(cfg, rng);
                if cfg.install_household {
                    topo.install_households();
                }
            }
            Policy::ExposureNotification if cfg.install_household => topo.install_households(),
            _ => {}
        }

        log::debug!(
            "built topology with {} households and {} clusters ({} public)",
            topo.households.len(),
            topo.clusters.len(),
            topo.public_clusters.len()
        );

        topo
    }

    pub fn installed(&self) -> usize {
        self.people.iter().filter(|p| p.attrs.app_installed).count()
    }

    fn gatekeep_clusters(&mut self, cfg: &Config, rng: &mut RngGroup) {
        let limit = (cfg.gatekept_clusters * f64::from(cfg.population)).round() as usize;
        let mut order: Vec<usize> = (0..self.clusters.len()).collect();
        order.shuffle(&mut rng.shuffle);

        let mut converted = vec![false; self.people.len()];
        let mut n_converted = 0;
        for cluster_id in order {
            if n_converted >= limit {
                break;
            }
            let cluster = &mut self.clusters[cluster_id];
            cluster.gatekept = true;
            for &id in &cluster.members {
                if converted[id] {
                    continue;
                }
                converted[id] = true;
                n_converted += 1;

                let member = &mut self.people[id];
                if rng.install_own.chance(cfg.install_own) {
                    member.install_app(0);
                }
                if !member.attrs.app_installed {
                    member.attrs.prompted_own = true;
                }
            }
        }
    }

    fn install_households(&mut self) {
        for id in 0..self.people.len() {
            if !self.people[id].attrs.app_installed {
                continue;
            }
            let contacts = self.people[id].household_contacts.clone();
            for other in contacts.into_iter().filter(|&other| other > id) {
                self.people[other].install_app(0);
            }
        }
    }
}

fn build_households(cfg: &Config, rng: &mut RngGroup, people: &mut [Person]) -> Vec<Vec<usize>> {
    let population = people.len();
    let mut households = Vec::new();
    let mut next = 0;
    while next < population {
        let size = cfg.household.sample(&mut rng.household) as usize;
        let end = (next + size.max(1)).min(population);
        let members: Vec<usize> = (next..end).collect();
        for &id in &members {
            let person = &mut people[id];
            person.household = households.len();
            person.household_contacts = members.iter().copied().filter(|&o| o != id).collect();
        }
        households.push(members);
        next = end;
    }
    households
}

fn build_clusters(
    cfg: &Config,
    rng: &mut RngGroup,
    people: &mut [Person],
) -> (Vec<Cluster>, Vec<usize>, Vec<usize>) {
    let population = people.len();
    let mut order: Vec<usize> = (0..population).collect();
    order.shuffle(&mut rng.shuffle);

    // Primary clusters partition the shuffled population.
    let mut clusters: Vec<Cluster> = Vec::new();
    let mut public_clusters = Vec::new();
    let mut private_clusters = Vec::new();
    let mut next = 0;
    while next < population {
        let size = cfg.cluster_size.sample(&mut rng.cluster_size) as usize;
        let end = (next + size.max(1)).min(population);
        let cluster_id = clusters.len();
        let members = order[next..end].to_vec();
        for &id in &members {
            people[id].clusters.push(cluster_id);
        }
        let public = rng.public_clusters.chance(cfg.public_clusters);
        if public {
            public_clusters.push(cluster_id);
        } else {
            private_clusters.push(cluster_id);
        }
        clusters.push(Cluster {
            members,
            public,
            gatekept: false,
        });
        next = end;
    }

    // Secondary clusters, distinct from the ones a person already has.
    let n_clusters = clusters.len();
    for person in people.iter_mut() {
        let count = cfg.cluster_count.sample(&mut rng.cluster_count) as usize;
        for _ in 1..count.min(n_clusters) {
            let mut cluster_id = rng.additional_cluster.random_range(0..n_clusters);
            while person.clusters.contains(&cluster_id) {
                cluster_id = rng.additional_cluster.random_range(0..n_clusters);
            }
            clusters[cluster_id].members.push(person.id);
            person.clusters.push(cluster_id);
        }
    }

    (clusters, public_clusters, private_clusters)
}

fn trace_days(policy: Policy) -> u32 {
    if policy.uses_app() { TRACE_DAYS } else { 0 }
}

impl Computed {
    pub fn new(cfg: &Config, policy: Policy, topo: &Topology) -> Self {
        let population = f64::from(cfg.population);
        let days = f64::from(cfg.days);
        let trace_days = trace_days(policy);
        let inactivity_penalty = if trace_days > 0 {
            100.0 / f64::from(trace_days)
        } else {
            0.0
        };
        let infectious_days =
            cfg.pre_symptomatic_infectious_days as usize + cfg.illness.estimate_mean().round() as usize;
        Self {
            daily_foreign: cfg.foreign_imports / population,
            daily_tests: (cfg.daily_test_capacity * population).round() as usize,
            trace_days,
            inactivity_penalty,
            infectious_days: infectious_days.max(1),
            install_foreign: cfg.install_foreign / days,
            install_own: cfg.install_own / days,
            install_base: topo.installed() as f64 / population,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SMALL;
    use crate::model::Health;

    fn small_config() -> Config {
        Config::from_toml(SMALL).expect("config should be valid")
    }

    #[test]
    fn households_partition_population() {
        let cfg = small_config();
        let topo = Topology::build(&cfg, Policy::FreeMovement, &mut RngGroup::new(3));
        let mut seen = vec![0; topo.people.len()];
        for (house_id, members) in topo.households.iter().enumerate() {
            assert!(!members.is_empty());
            for &id in members {
                seen[id] += 1;
                let person = &topo.people[id];
                assert_eq!(person.household, house_id);
                assert_eq!(person.household_contacts.len(), members.len() - 1);
                assert!(!person.household_contacts.contains(&id));
            }
        }
        assert!(seen.iter().all(|&count| count == 1));
    }

    #[test]
    fn every_person_has_distinct_clusters() {
        let cfg = small_config();
        let topo = Topology::build(&cfg, Policy::FreeMovement, &mut RngGroup::new(3));
        for person in &topo.people {
            assert!(!person.clusters.is_empty());
            let mut ids = person.clusters.clone();
            ids.sort_unstable();
            ids.dedup();
            assert_eq!(ids.len(), person.clusters.len());
            for &cluster_id in &person.clusters {
                assert!(topo.clusters[cluster_id].members.contains(&person.id));
            }
            assert_eq!(person.status.health, Health::Healthy);
        }
        assert_eq!(
            topo.public_clusters.len() + topo.private_clusters.len(),
            topo.clusters.len()
        );
    }

    #[test]
    fn secondary_clusters_are_capped() {
        let mut cfg = small_config();
        cfg.population = 6;
        cfg.cluster_size = crate::dist::Dist::Poisson {
            mean: 3.0,
            min: 3,
            max: 3,
        };
        cfg.cluster_count = crate::dist::Dist::Zipf { min: 10, max: 10 };
        let topo = Topology::build(&cfg, Policy::FreeMovement, &mut RngGroup::new(5));
        assert_eq!(topo.clusters.len(), 2);
        assert!(topo.people.iter().all(|p| p.clusters.len() == 2));
    }

    #[test]
    fn only_app_policies_install() {
        let cfg = small_config();
        let free = Topology::build(&cfg, Policy::Lockdown, &mut RngGroup::new(9));
        assert_eq!(free.installed(), 0);
        let score = Topology::build(&cfg, Policy::ReputationScore, &mut RngGroup::new(9));
        assert!(score.installed() > 0);
        assert!(score.clusters.iter().any(|c| c.gatekept));
    }
}
