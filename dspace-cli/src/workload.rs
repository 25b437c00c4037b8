//! Demo workload run by every participant.
//!
//! Each participant diffuses a heat field over its leaf and moves a set of
//! random walkers around. Walkers leave heat behind and migrate between
//! processes as they cross leaf boundaries. Walker counts are skewed towards
//! higher ranks so the rebalancer has something to do.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use dspace_core::comm::all_gather_value;
use dspace_core::partition::CommitHook;
use dspace_core::query::publish_collective;
use dspace_core::{
    Communicator, Config, Coord, EventQueue, HaloField, Inspector, MigratingEntity, Migrator,
    Partition, Pid, Rebalancer, Region, Registry, Result,
};

/// Steps between checks for a stop request and registry syncs.
pub const SYNC_INTERVAL: u64 = 10;

/// Registry name of the walker with id 0.
pub const LEADER: &str = "leader";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMetric {
    /// Wall time spent on a step
    Time,
    /// Number of walkers held
    Walkers,
}

/// Workload settings, read from the `[workload]` table of the config file
/// and overridden by command line flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub steps: u64,
    /// Walkers created by rank 0, rank `n` creates `n + 1` times as many
    pub walkers: usize,
    pub seed: u64,
    /// Diffusion rate, stable for values up to `1 / (2 * dims)`
    pub diffusion: f64,
    /// Heat left behind by a walker on every step
    pub deposit: f64,
    /// Largest distance travelled by a walker along each dimension
    pub speed: f64,
    pub load: LoadMetric,
    /// Steps between inspector publishes, `0` disables publishing
    pub publish_interval: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            steps: 500,
            walkers: 100,
            seed: 0,
            diffusion: 0.1,
            deposit: 1.,
            speed: 1.5,
            load: LoadMetric::Walkers,
            publish_interval: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Walker {
    id: u64,
    location: Vec<f64>,
}

/// Outcome of a participant's run.
#[derive(Debug, Clone)]
pub struct Summary {
    pub pid: Pid,
    pub steps: u64,
    pub region: Region,
    pub walkers: usize,
    pub commits: usize,
    pub in_flight: usize,
    pub heat: f64,
    pub leader: Option<Pid>,
}

/// Runs the workload on a single participant. Collective, every
/// participant must call it with the same config and settings.
pub fn run<C: Communicator>(
    mut comm: C,
    config: &Config,
    settings: &Settings,
    inspector: Option<Arc<Inspector>>,
    running: Arc<AtomicBool>,
) -> Result<Summary> {
    let tree = config.build_tree(comm.size())?;
    let mut partition = Partition::new(
        tree,
        config.domain.aoi,
        config.domain.toroidal,
        &mut comm,
    )?;
    let pid = partition.pid();
    let mut heat: HaloField = HaloField::new("heat", &partition)?;
    let mut migrator = Migrator::new(&partition, config.migration.rounds)?;
    let mut rebalancer = Rebalancer::new(config.balance.clone(), &partition)?;
    let mut registry = Registry::new();
    let mut queue = EventQueue::new();
    let mut rng = StdRng::seed_from_u64(settings.seed.wrapping_add(pid as u64));

    let mut walkers = spawn_walkers(&mut rng, partition.local_region(), pid, settings);
    if walkers.iter().any(|w| w.id == 0) {
        registry.insert(LEADER, pid);
    }
    info!(
        "process {} owns {} with {} walkers",
        pid,
        partition.local_region(),
        walkers.len()
    );

    let mut commits = 0;
    let mut steps = 0;
    while steps < settings.steps {
        if steps % SYNC_INTERVAL == 0 {
            let stop = !running.load(Ordering::SeqCst);
            if all_gather_value(&mut comm, &stop)?.iter().any(|s| *s) {
                info!("process {}: stop requested at step {}", pid, steps);
                break;
            }
            registry.sync(&mut comm)?;
        }
        let started = Instant::now();

        heat.sync(&mut comm)?;
        diffuse(&mut heat, &partition, settings.diffusion)?;

        let mut staying = Vec::with_capacity(walkers.len());
        for mut walker in walkers.drain(..) {
            step_walker(&mut walker, &mut rng, &partition, settings.speed);
            let cell: Vec<Coord> = walker.location.iter().map(|v| v.floor() as Coord).collect();
            if partition.local_region().contains(&cell) {
                if let Some(v) = heat.get(&cell) {
                    heat.set(&cell, v + settings.deposit)?;
                }
                staying.push(walker);
            } else {
                send_walker(&mut migrator, walker, steps)?;
            }
        }
        walkers = staying;

        migrator.run_epoch(&mut queue, &mut comm)?;
        for entity in queue.advance(steps as f64) {
            let walker = receive_walker(entity)?;
            if walker.id == 0 {
                registry.insert(LEADER, pid);
            }
            walkers.push(walker);
        }

        let load = match settings.load {
            LoadMetric::Time => started.elapsed().as_secs_f64(),
            LoadMetric::Walkers => walkers.len() as f64,
        };
        rebalancer.record_load(load);

        if rebalancer.should_balance(steps) {
            let outcome = {
                let mut hooks: [&mut dyn CommitHook; 2] = [&mut heat, &mut migrator];
                rebalancer.balance(&mut partition, &mut hooks, &mut comm)?
            };
            if outcome.applied() > 0 {
                commits += 1;
                debug!(
                    "process {} now owns {} after {:?}",
                    pid,
                    partition.local_region(),
                    outcome
                );
                // walkers standing on cells handed over to a neighbor
                let (keep, leave): (Vec<_>, Vec<_>) = walkers
                    .drain(..)
                    .partition(|w| partition.local_region().contains_f(&w.location));
                walkers = keep;
                for walker in leave {
                    send_walker(&mut migrator, walker, steps)?;
                }
            }
        }

        if settings.publish_interval > 0 && steps % settings.publish_interval == 0 {
            publish_collective(
                inspector.as_deref(),
                0,
                &partition,
                &[heat.image()?],
                &mut comm,
            )?;
        }
        steps += 1;
    }

    // deliver whatever is still on the move
    let report = migrator.run_epoch(&mut queue, &mut comm)?;
    for entity in queue.drain() {
        walkers.push(receive_walker(entity)?);
    }
    registry.sync(&mut comm)?;

    let mut total = 0.;
    partition.local_region().for_each_point(|p| {
        total += heat.get(p).unwrap_or(0.);
    });

    Ok(Summary {
        pid,
        steps,
        region: partition.local_region().clone(),
        walkers: walkers.len(),
        commits,
        in_flight: report.in_flight,
        heat: total,
        leader: registry.get(LEADER),
    })
}

fn spawn_walkers(rng: &mut StdRng, region: &Region, pid: Pid, settings: &Settings) -> Vec<Walker> {
    let count = settings.walkers * (pid + 1);
    (0..count)
        .map(|n| Walker {
            id: (pid * count + n) as u64,
            location: (0..region.dims())
                .map(|d| rng.gen_range(region.min[d] as f64, region.max[d] as f64))
                .collect(),
        })
        .collect()
}

fn send_walker(migrator: &mut Migrator, walker: Walker, step: u64) -> Result<()> {
    let mut entity = MigratingEntity::new(0, bincode::serialize(&walker)?);
    entity.ordering = walker.id as i64;
    entity.scheduled_time = step as f64;
    migrator.migrate_to_location(walker.location, entity)
}

/// Decodes a delivered walker. The entity location is the wrapped one.
fn receive_walker(entity: MigratingEntity) -> Result<Walker> {
    let mut walker: Walker = bincode::deserialize(&entity.payload)?;
    if let Some(location) = entity.location {
        walker.location = location;
    }
    Ok(walker)
}

/// Random step, reflected back into the domain unless it wraps around.
fn step_walker(walker: &mut Walker, rng: &mut StdRng, partition: &Partition, speed: f64) {
    let domain = partition.domain();
    for (d, v) in walker.location.iter_mut().enumerate() {
        *v += rng.gen_range(-speed, speed);
        if partition.toroidal() {
            continue;
        }
        let (lo, hi) = (domain.min[d] as f64, domain.max[d] as f64);
        if *v < lo {
            *v = (2. * lo - *v).min(hi - f64::EPSILON);
        } else if *v >= hi {
            *v = (2. * hi - *v).max(lo);
        }
        // reflection may still land on the upper bound
        if *v >= hi {
            *v = lo.max(hi - 1.);
        }
    }
}

/// Explicit diffusion over the local region. Ghost cells must be in sync.
/// Cells outside a non-toroidal domain mirror the cell next to them, which
/// keeps the boundary insulated.
fn diffuse(heat: &mut HaloField, partition: &Partition, rate: f64) -> Result<()> {
    let local = heat.local_region().clone();
    let domain = partition.domain();
    let toroidal = partition.toroidal();
    let mut next = Vec::with_capacity(local.volume() as usize);
    local.for_each_point(|p| {
        let here = heat.get(p).unwrap_or(0.);
        let mut flow = 0.;
        let mut q = p.to_vec();
        for d in 0..p.len() {
            for delta in &[-1, 1] {
                q[d] = p[d] + delta;
                let there = if toroidal || domain.contains(&q) {
                    heat.get(&q).unwrap_or(here)
                } else {
                    here
                };
                flow += there - here;
            }
            q[d] = p[d];
        }
        next.push(here + rate * flow);
    });
    let mut values = next.into_iter();
    heat.fill_local(|_| values.next().unwrap_or(0.))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dspace_core::LocalCluster;

    fn settings() -> Settings {
        Settings {
            steps: 60,
            walkers: 20,
            publish_interval: 0,
            ..Settings::default()
        }
    }

    fn config() -> Config {
        let mut config = Config::new(vec![32, 32]);
        config.balance.interval = 20;
        config
    }

    #[test]
    fn walkers_are_conserved() {
        let results = LocalCluster::run(4, |comm| {
            run(
                comm,
                &config(),
                &settings(),
                None,
                Arc::new(AtomicBool::new(true)),
            )
        });
        let summaries: Vec<Summary> = results.into_iter().map(|r| r.unwrap()).collect();
        let total: usize = summaries.iter().map(|s| s.walkers + s.in_flight).sum();
        assert_eq!(total, 20 * (1 + 2 + 3 + 4));
        let volume: u64 = summaries.iter().map(|s| s.region.volume()).sum();
        assert_eq!(volume, 32 * 32);
        // every process agrees on who holds the leader
        let leader = summaries[0].leader;
        assert!(leader.is_some());
        assert!(summaries.iter().all(|s| s.leader == leader));
    }

    #[test]
    fn stop_request_ends_every_participant() {
        let results = LocalCluster::run(4, |comm| {
            run(
                comm,
                &config(),
                &settings(),
                None,
                Arc::new(AtomicBool::new(false)),
            )
        });
        for summary in results {
            assert_eq!(summary.unwrap().steps, 0);
        }
    }

    #[test]
    fn publishes_to_inspector() {
        use dspace_core::RemoteQuery;
        let inspector = Arc::new(Inspector::new());
        let shared = inspector.clone();
        let results = LocalCluster::run(4, move |comm| {
            let inspector = if comm.rank() == 0 {
                Some(shared.clone())
            } else {
                None
            };
            let settings = Settings {
                publish_interval: 5,
                ..settings()
            };
            run(
                comm,
                &config(),
                &settings,
                inspector,
                Arc::new(AtomicBool::new(true)),
            )
        });
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(inspector.version().unwrap(), 12);
        let images = inspector.fetch_leaf_storage(3).unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].name, "heat");
    }
}
