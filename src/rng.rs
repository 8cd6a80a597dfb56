use rand::RngCore;

const TWO_POW_32: f64 = 4_294_967_296.0;
const TWO_POW_NEG_32: f64 = 2.328_306_436_538_696_3e-10;

/// Seedable generator built from three fractional lag registers and a carry.
///
/// Seeded from an arbitrary string, so a stream can be named after the
/// decision it drives. Two generators built from the same string yield the
/// same sequence.
#[derive(Clone, Debug)]
pub struct Alea {
    c: f64,
    s0: f64,
    s1: f64,
    s2: f64,
}

struct Mash {
    n: f64,
}

impl Mash {
    fn new() -> Self {
        Self {
            n: f64::from(0xefc8_249d_u32),
        }
    }

    fn hash(&mut self, data: &str) -> f64 {
        for unit in data.encode_utf16() {
            self.n += f64::from(unit);
            let mut h = 0.025_196_032_824_169_38 * self.n;
            self.n = to_uint32(h);
            h -= self.n;
            h *= self.n;
            self.n = to_uint32(h);
            h -= self.n;
            self.n += h * TWO_POW_32;
        }
        to_uint32(self.n) * TWO_POW_NEG_32
    }
}

fn to_uint32(val: f64) -> f64 {
    val.trunc().rem_euclid(TWO_POW_32)
}

impl Alea {
    pub fn new(seed: &str) -> Self {
        let mut mash = Mash::new();
        let mut s0 = mash.hash(" ");
        let mut s1 = mash.hash(" ");
        let mut s2 = mash.hash(" ");
        for s in [&mut s0, &mut s1, &mut s2] {
            *s -= mash.hash(seed);
            if *s < 0.0 {
                *s += 1.0;
            }
        }
        Self { c: 1.0, s0, s1, s2 }
    }

    /// Next uniform draw in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        let t = 2_091_639.0 * self.s0 + self.c * TWO_POW_NEG_32;
        self.s0 = self.s1;
        self.s1 = self.s2;
        self.c = t.trunc();
        self.s2 = t - self.c;
        self.s2
    }

    /// Bernoulli roll with success probability `prob`.
    pub fn chance(&mut self, prob: f64) -> bool {
        self.next_f64() < prob
    }
}

impl RngCore for Alea {
    fn next_u32(&mut self) -> u32 {
        (self.next_f64() * TWO_POW_32) as u32
    }

    fn next_u64(&mut self) -> u64 {
        let hi = u64::from(self.next_u32());
        let lo = u64::from(self.next_u32());
        (hi << 32) | lo
    }

    fn fill_bytes(&mut self, dst: &mut [u8]) {
        for chunk in dst.chunks_mut(4) {
            let bytes = self.next_u32().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }
}

macro_rules! rng_group {
    ($($field:ident => $label:literal,)*) => {
        /// One independent [`Alea`] stream per decision category of a run.
        ///
        /// Each stream is seeded with `"<category>-<seed>"`, so draws made for
        /// one category never shift the sequence seen by another.
        pub struct RngGroup {
            $(pub $field: Alea,)*
        }

        impl RngGroup {
            pub fn new(seed: u64) -> Self {
                Self {
                    $($field: Alea::new(&format!(concat!($label, "-{}"), seed)),)*
                }
            }
        }
    };
}

// Append only: renaming a label changes every trajectory that depends on it.
rng_group! {
    additional_cluster => "additionalCluster",
    app_installed => "appInstalled",
    cluster_count => "clusterCount",
    cluster_size => "clusterSize",
    exposed_visit => "exposedVisit",
    fatality => "fatality",
    foreign => "foreign",
    group_size => "groupSize",
    household => "household",
    illness => "illness",
    immunity => "immunity",
    infect => "infect",
    init => "init",
    install_foreign => "installForeign",
    install_own => "installOwn",
    isolation_effectiveness => "isolationEffectiveness",
    isolation_likelihood => "isolationLikelihood",
    isolation_lockdown => "isolationLockdown",
    isolation_symptomatic => "isolationSymptomatic",
    key_worker => "keyWorker",
    public_clusters => "publicClusters",
    select_own_cluster => "selectOwnCluster",
    select_private_cluster => "selectPrivateCluster",
    select_public_cluster => "selectPublicCluster",
    self_attestation => "selfAttestation",
    shuffle => "shuffle",
    shuffle_group => "shuffleGroup",
    symptomatic => "symptomatic",
    test_delay => "testDelay",
    test_key_worker => "testKeyWorker",
    test_notified => "testNotified",
    test_symptomatic => "testSymptomatic",
    vaccinated => "vaccinated",
    visit_foreign_cluster => "visitForeignCluster",
    visit_public_cluster => "visitPublicCluster",
}
