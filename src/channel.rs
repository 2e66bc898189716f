//! The channel scheduler (§4.4): task-range application, channel
//! merging, and derivation of per-jobscript dependency relationships.
//!
//! Channel merging here is resolved under the "all-to-one" reading
//! of §4.4/§9's open question: when the set of distinct `sub_order`
//! values shrinks between one `exec_order` and the next, every
//! channel absent from the new set is treated as feeding every
//! command group declared at the new `exec_order` (in practice,
//! S3-style declarations have exactly one survivor). This is the
//! simplest rule consistent with "no channel may split" and with the
//! merged channel id being the minimum of its parents'.

use std::collections::{BTreeMap, BTreeSet};

use crate::command_group::CommandGroup;

#[derive(thiserror::Error, Debug)]
pub enum ChannelError {
    #[error("expected {expected} task ranges (one per channel), got {got}")]
    RangeCountMismatch { expected: usize, got: usize },

    #[error("task range start={start} end={end:?} is out of bounds for channel length {length}")]
    RangeOutOfBounds {
        start: usize,
        end: Option<usize>,
        length: usize,
    },

    #[error("command group at exec_order {exec_order} declares channel split: sub_order set \
              {declared:?} is not a subset of the prior exec_order's channels {parents:?}")]
    IllegalChannelSplit {
        exec_order: u32,
        declared: BTreeSet<u32>,
        parents: BTreeSet<u32>,
    },

    #[error("exec_order {0} has no command groups for a declared channel width of {1}")]
    MissingChannel(u32, usize),
}

/// One `(start, end?, step?)` task-range tuple selected for a
/// channel at `exec_order = 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TaskRange {
    pub start: usize,
    pub end: Option<usize>,
    pub step: Option<usize>,
}

impl TaskRange {
    pub fn full() -> Self {
        Self {
            start: 0,
            end: None,
            step: None,
        }
    }

    fn indices(&self, length: usize) -> Result<Vec<usize>, ChannelError> {
        let end = self.end.unwrap_or(length);
        if self.start > length || end > length || self.start > end {
            return Err(ChannelError::RangeOutOfBounds {
                start: self.start,
                end: self.end,
                length,
            });
        }
        let step = self.step.unwrap_or(1).max(1);
        Ok((self.start..end).step_by(step).collect())
    }
}

/// One scheduled jobscript: the command group it was emitted for,
/// its (possibly merged) channel id, the task indices it runs, and
/// the prior command-group indices whose completion gates it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ScheduledGroup {
    pub group_index: usize,
    pub channel: u32,
    pub task_indices: Vec<usize>,
    pub depends_on: BTreeSet<usize>,
}

/// Computes `C₀`, the channel width: the count of distinct
/// `sub_order` values among command groups at the minimum
/// `exec_order`.
pub fn channel_width(groups: &[CommandGroup]) -> usize {
    let Some(min_exec) = groups.iter().map(|g| g.exec_order).min() else {
        return 0;
    };
    groups
        .iter()
        .filter(|g| g.exec_order == min_exec)
        .map(|g| g.sub_order)
        .collect::<BTreeSet<_>>()
        .len()
}

/// `variable_product_len(group)` supplies the resolved
/// variable-product task count for a command group, when it has one
/// (i.e. it references at least one variable); groups with no
/// variable references return `None` and inherit their task count
/// from the channel mechanics (identity carry-over, or the summed
/// parent count across a merge).
pub fn schedule(
    groups: &[CommandGroup],
    ranges: Option<&[TaskRange]>,
    variable_product_len: impl Fn(&CommandGroup) -> Option<usize>,
) -> Result<Vec<ScheduledGroup>, ChannelError> {
    let mut by_exec: BTreeMap<u32, Vec<&CommandGroup>> = BTreeMap::new();
    for g in groups {
        by_exec.entry(g.exec_order).or_default().push(g);
    }
    for level in by_exec.values_mut() {
        level.sort_by_key(|g| (g.sub_order, g.index));
    }

    let mut out = Vec::new();
    // channel -> (selected task indices, originating group_index)
    let mut active: BTreeMap<u32, (Vec<usize>, usize)> = BTreeMap::new();
    let mut first_level = true;

    for (exec_order, level_groups) in &by_exec {
        let declared: BTreeSet<u32> = level_groups.iter().map(|g| g.sub_order).collect();

        if first_level {
            let c0 = declared.len();
            if let Some(ranges) = ranges {
                if ranges.len() != c0 {
                    return Err(ChannelError::RangeCountMismatch {
                        expected: c0,
                        got: ranges.len(),
                    });
                }
            }
            let rank: BTreeMap<u32, usize> =
                declared.iter().enumerate().map(|(i, &sub)| (sub, i)).collect();
            for g in level_groups {
                let length = variable_product_len(g).unwrap_or(0);
                let range = ranges
                    .map(|rs| rs[rank[&g.sub_order]])
                    .unwrap_or_else(TaskRange::full);
                let indices = range.indices(length)?;
                active.insert(g.sub_order, (indices.clone(), g.index));
                out.push(ScheduledGroup {
                    group_index: g.index,
                    channel: g.sub_order,
                    task_indices: indices,
                    depends_on: BTreeSet::new(),
                });
            }
            first_level = false;
            continue;
        }

        let parents: BTreeSet<u32> = active.keys().copied().collect();
        if !declared.is_subset(&parents) {
            return Err(ChannelError::IllegalChannelSplit {
                exec_order: *exec_order,
                declared,
                parents,
            });
        }

        if declared == parents {
            // 1:1 continuation along each channel.
            for g in level_groups {
                let (parent_indices, parent_group) = active[&g.sub_order].clone();
                let effective = if let Some(len) = variable_product_len(g) {
                    (0..len).collect::<Vec<_>>()
                } else {
                    parent_indices
                };
                let depends_on = [parent_group].into_iter().collect();
                active.insert(g.sub_order, (effective.clone(), g.index));
                out.push(ScheduledGroup {
                    group_index: g.index,
                    channel: g.sub_order,
                    task_indices: effective,
                    depends_on,
                });
            }
        } else {
            // Merge: every channel in `parents` feeds every group
            // declared at this exec_order. The merged channel id is
            // the minimum of the parents being merged.
            let merged_channel = *parents.iter().min().expect("parents non-empty");
            let merged_sum: usize = active.values().map(|(indices, _)| indices.len()).sum();
            let parent_group_ids: BTreeSet<usize> =
                active.values().map(|(_, idx)| *idx).collect();
            active.clear();
            for g in level_groups {
                let task_count = variable_product_len(g).unwrap_or(merged_sum);
                let indices: Vec<usize> = (0..task_count).collect();
                active.insert(merged_channel, (indices.clone(), g.index));
                out.push(ScheduledGroup {
                    group_index: g.index,
                    channel: merged_channel,
                    task_indices: indices,
                    depends_on: parent_group_ids.clone(),
                });
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_group::OptionsOverride;

    fn group(index: usize, exec_order: u32, sub_order: u32) -> CommandGroup {
        CommandGroup {
            index,
            exec_order,
            sub_order,
            commands: vec!["run".to_string()],
            overrides: OptionsOverride::default(),
            parallel_variables: false,
            profile_name: None,
            profile_order: None,
        }
    }

    #[test]
    fn t_channel_width() {
        let groups = vec![group(0, 0, 0), group(1, 0, 1), group(2, 1, 0)];
        assert_eq!(channel_width(&groups), 2);
    }

    #[test]
    fn t_s3_merge_at_exec1() {
        let groups = vec![group(0, 0, 0), group(1, 0, 1), group(2, 1, 0)];
        let lens = |g: &CommandGroup| match g.index {
            0 => Some(3),
            1 => Some(5),
            _ => None,
        };
        let scheduled = schedule(&groups, None, lens).unwrap();
        let g0 = &scheduled[0];
        let g1 = &scheduled[1];
        let g2 = &scheduled[2];
        assert_eq!(g0.task_indices.len(), 3);
        assert_eq!(g1.task_indices.len(), 5);
        assert_eq!(g2.channel, 0);
        assert_eq!(g2.depends_on, BTreeSet::from([0, 1]));
        assert_eq!(g2.task_indices.len(), 8);
    }

    #[test]
    fn t_exec_order_zero_has_no_deps() {
        let groups = vec![group(0, 0, 0)];
        let scheduled = schedule(&groups, None, |_| Some(1)).unwrap();
        assert!(scheduled[0].depends_on.is_empty());
    }

    #[test]
    fn t_single_task_group() {
        let groups = vec![group(0, 0, 0)];
        let scheduled = schedule(&groups, None, |_| Some(1)).unwrap();
        assert_eq!(scheduled[0].task_indices, vec![0]);
    }

    #[test]
    fn t_ranges_indexed_by_rank_not_raw_sub_order() {
        // Non-contiguous sub_order {0, 2}: declaration-level validation
        // normally rejects this, but the scheduler itself must not
        // panic on it — two ranges (matching c0=2) index by rank, not
        // by the raw sub_order value 2.
        let groups = vec![group(0, 0, 0), group(1, 0, 2)];
        let ranges = vec![TaskRange::full(), TaskRange::full()];
        let scheduled = schedule(&groups, Some(&ranges), |_| Some(3)).unwrap();
        assert_eq!(scheduled.len(), 2);
    }

    #[test]
    fn t_range_count_mismatch() {
        let groups = vec![group(0, 0, 0), group(1, 0, 1)];
        let ranges = vec![TaskRange::full()];
        let err = schedule(&groups, Some(&ranges), |_| Some(3)).unwrap_err();
        assert!(matches!(err, ChannelError::RangeCountMismatch { .. }));
    }

    #[test]
    fn t_illegal_split_rejected() {
        // exec1 declares a sub_order (5) that wasn't present at exec0.
        let groups = vec![group(0, 0, 0), group(1, 1, 5)];
        let err = schedule(&groups, None, |_| Some(1)).unwrap_err();
        assert!(matches!(err, ChannelError::IllegalChannelSplit { .. }));
    }
}
