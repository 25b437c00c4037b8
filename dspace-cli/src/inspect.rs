//! Printing snapshots fetched through `RemoteQuery`.

use anyhow::Result;
use colored::*;

use dspace_core::halo::ElementKind;
use dspace_core::query::{FieldImage, SnapshotInfo};
use dspace_core::{Coord, Pid, RemoteQuery};

/// What to ask for while the snapshot is locked.
#[derive(Debug, Clone, Default)]
pub struct Queries {
    pub owners: Vec<Vec<Coord>>,
    /// Leaves to fetch, all of them if empty
    pub leaves: Vec<Pid>,
}

/// Locks the snapshot, runs the queries and unlocks it again, even if one
/// of the queries failed.
pub fn inspect<Q: RemoteQuery>(target: &Q, queries: &Queries) -> Result<()> {
    let info = target.lock_snapshot()?;
    let result = print_queries(target, &info, queries);
    target.unlock_snapshot()?;
    result
}

fn print_queries<Q: RemoteQuery>(target: &Q, info: &SnapshotInfo, queries: &Queries) -> Result<()> {
    print_info(info);
    if info.version == 0 {
        return Ok(());
    }
    for coord in &queries.owners {
        match target.point_to_owner(coord) {
            Ok(pid) => println!("{:?} {} {}", coord, "->".cyan(), pid),
            Err(e) => println!("{:?} {} {}", coord, "->".cyan(), e.to_string().red()),
        }
    }
    let leaves = if queries.leaves.is_empty() {
        (0..info.leaves).collect()
    } else {
        queries.leaves.clone()
    };
    for leaf in leaves {
        let images = target.fetch_leaf_storage(leaf)?;
        println!("{} {}", "leaf".bold(), leaf);
        for image in &images {
            print_image(image);
        }
    }
    Ok(())
}

fn print_info(info: &SnapshotInfo) {
    println!("{} {}", "snapshot version:".bold(), info.version);
    match info.published {
        Some(time) => println!("{} {}", "published:".bold(), time.format("%Y-%m-%d %H:%M:%S%.3f")),
        None => println!("{}", "nothing published yet".yellow()),
    }
    if let Some(domain) = &info.domain {
        println!("{} {}", "domain:".bold(), domain);
    }
    println!("{} {}", "leaves:".bold(), info.leaves);
}

fn print_image(image: &FieldImage) {
    let stats = match image.kind {
        ElementKind::F64 => stats_f64(&image.bytes),
        _ => None,
    };
    match stats {
        Some((min, max, mean)) => println!(
            "  {} {} {} min {:.3} max {:.3} mean {:.3}",
            image.name.green(),
            image.kind,
            image.region,
            min,
            max,
            mean
        ),
        None => println!(
            "  {} {} {} ({} bytes)",
            image.name.green(),
            image.kind,
            image.region,
            image.bytes.len()
        ),
    }
}

/// Min, max and mean of little-endian `f64` values.
fn stats_f64(bytes: &[u8]) -> Option<(f64, f64, f64)> {
    let values: Vec<f64> = bytes
        .chunks_exact(8)
        .map(|c| {
            let mut b = [0u8; 8];
            b.copy_from_slice(c);
            f64::from_le_bytes(b)
        })
        .collect();
    if values.is_empty() {
        return None;
    }
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    Some((min, max, mean))
}

/// Parses `x,y,...` into a coordinate.
pub fn parse_coord(s: &str) -> Result<Vec<Coord>> {
    s.split(',')
        .map(|v| {
            v.trim()
                .parse::<Coord>()
                .map_err(|e| anyhow::Error::msg(format!("invalid coordinate `{}`: {}", s, e)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coords() {
        assert_eq!(parse_coord("3, 4").unwrap(), vec![3, 4]);
        assert!(parse_coord("3,x").is_err());
    }

    #[test]
    fn f64_stats() {
        let bytes: Vec<u8> = [1f64, 3., 2.]
            .iter()
            .flat_map(|v| v.to_le_bytes().to_vec())
            .collect();
        assert_eq!(stats_f64(&bytes), Some((1., 3., 2.)));
        assert_eq!(stats_f64(&[]), None);
    }
}
