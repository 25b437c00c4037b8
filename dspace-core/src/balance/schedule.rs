use crate::Pid;

/// Greedy proper coloring of the conflict graph between processes.
///
/// Two processes conflict when an action one of them may propose can
/// touch a leaf that an action of the other may touch as well. Processes
/// sharing a color never conflict, so the proposals of one slot always
/// involve disjoint leaves. One color is active per balancing slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    colors: Vec<usize>,
    count: usize,
}

impl Schedule {
    /// Colors processes in pid order, each taking the smallest color not
    /// used by an already colored process it conflicts with.
    pub fn new(conflicts: &[Vec<Pid>]) -> Self {
        let mut colors: Vec<Option<usize>> = vec![None; conflicts.len()];
        for pid in 0..conflicts.len() {
            let taken: Vec<usize> = conflicts[pid]
                .iter()
                .filter_map(|n| colors.get(*n).cloned().flatten())
                .collect();
            let color = (0..).find(|c| !taken.contains(c)).unwrap_or(0);
            colors[pid] = Some(color);
        }
        let colors: Vec<usize> = colors.into_iter().map(|c| c.unwrap_or(0)).collect();
        let count = colors.iter().max().map(|m| m + 1).unwrap_or(1);
        Schedule { colors, count }
    }

    /// Number of colors used.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn color_of(&self, pid: Pid) -> usize {
        self.colors.get(pid).cloned().unwrap_or(0)
    }

    pub fn active_color(&self, slot: u64) -> usize {
        (slot % self.count as u64) as usize
    }

    pub fn is_active(&self, pid: Pid, slot: u64) -> bool {
        self.color_of(pid) == self.active_color(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_of_four_uses_two_colors() {
        let neighbors = vec![vec![1, 3], vec![0, 2], vec![1, 3], vec![0, 2]];
        let schedule = Schedule::new(&neighbors);
        assert_eq!(schedule.count(), 2);
        assert!(schedule.is_active(0, 0));
        assert!(schedule.is_active(2, 2));
        assert!(schedule.is_active(1, 1));
        assert!(!schedule.is_active(1, 0));
    }

    #[test]
    fn conflicting_processes_never_share_a_color() {
        let neighbors = vec![vec![1, 2, 3], vec![0, 2, 3], vec![0, 1, 3], vec![0, 1, 2]];
        let schedule = Schedule::new(&neighbors);
        assert_eq!(schedule.count(), 4);
        for (pid, ns) in neighbors.iter().enumerate() {
            for n in ns {
                assert_ne!(schedule.color_of(pid), schedule.color_of(*n));
            }
        }
    }
}
