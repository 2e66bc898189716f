//! The jobscript emitter (§4.6): turns one `(command_group,
//! task_indices, resolved variable rows)` triple into an abstract
//! jobscript description plus the per-variable value files the
//! jobscript's loop (and the runtime command-file writer) read from.
//! Scheduler dialect is someone else's problem (§1) — a bridge
//! translates this description into an actual script.

use std::path::{Path, PathBuf};

use crate::{command_group::CommandGroup, command_group::ResolvedOptions, resolver::Row};

/// Width needed to zero-pad `n` items' subdirectory names so every
/// name in the range has the same digit count: `⌈log₁₀(n+1)⌉`. The
/// historical bug this guards against is computing width from `n-1`
/// or similar off-by-ones that work for `n=9` but not `n=10`.
pub fn zero_pad_width(n: usize) -> usize {
    let mut width = 1;
    let mut threshold: usize = 10;
    while n >= threshold {
        width += 1;
        threshold = threshold.saturating_mul(10);
    }
    width
}

pub fn pad_index(index: usize, width: usize) -> String {
    format!("{index:0width$}")
}

fn round_half_to_even_div(numerator: usize, denom: usize) -> usize {
    let quotient = numerator / denom;
    let remainder = numerator % denom;
    match (remainder * 2).cmp(&denom) {
        std::cmp::Ordering::Less => quotient,
        std::cmp::Ordering::Greater => quotient + 1,
        std::cmp::Ordering::Equal => {
            if quotient % 2 == 0 {
                quotient
            } else {
                quotient + 1
            }
        }
    }
}

/// Splits `total` tasks across `subdirs` submit subdirectories as
/// evenly as possible. Boundaries are computed with round-half-to-
/// even division of `total * i / subdirs` rather than front-loading
/// the remainder, so the split is stable and reproducible and no
/// index is duplicated or dropped (the sum of the returned counts
/// always equals `total`).
pub fn distribute_into_subdirs(total: usize, subdirs: usize) -> Vec<usize> {
    if subdirs == 0 {
        return Vec::new();
    }
    let boundaries: Vec<usize> = (0..=subdirs)
        .map(|i| round_half_to_even_div(total * i, subdirs))
        .collect();
    boundaries.windows(2).map(|w| w[1] - w[0]).collect()
}

pub fn variable_file_name(command_group_index: usize, variable_name: &str) -> String {
    format!("group-{command_group_index}.{variable_name}.values")
}

fn variable_file_lines(rows: &[Row], variable_name: &str) -> Vec<String> {
    rows.iter().map(|r| r[variable_name].clone()).collect()
}

/// Writes one plain-text value file per variable the group
/// references, one line per row (§4.2 Phase B). Returns the written
/// paths in the same order as `group.referenced_variables()`.
pub fn write_variable_files(
    group: &CommandGroup,
    rows: &[Row],
    dir: &Path,
) -> std::io::Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)?;
    group
        .referenced_variables()
        .into_iter()
        .map(|name| {
            let path = dir.join(variable_file_name(group.index, &name));
            let mut content = variable_file_lines(rows, &name).join("\n");
            if !content.is_empty() {
                content.push('\n');
            }
            std::fs::write(&path, content)?;
            Ok(path)
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct JobscriptHeader {
    pub working_dir: Option<PathBuf>,
    pub modules: Vec<String>,
    pub scheduler_options: serde_json::Value,
    pub job_array: bool,
    pub array_len: usize,
}

#[derive(Debug, Clone)]
pub struct JobscriptBody {
    pub command_group_index: usize,
    pub variable_file_names: Vec<String>,
    pub parallel_variables: bool,
}

/// An abstract jobscript: header metadata, a body describing how to
/// bind variable files and loop over tasks, and the location of the
/// variable files themselves. The trailing command-file-writer call
/// is implicit — every runtime bridge invokes `write_cmd` the same
/// way, so it is not part of this description.
#[derive(Debug, Clone)]
pub struct Jobscript {
    pub header: JobscriptHeader,
    pub body: JobscriptBody,
    pub variable_dir: PathBuf,
}

pub fn emit(
    group: &CommandGroup,
    task_indices: &[usize],
    options: ResolvedOptions,
    variable_dir: &Path,
) -> Jobscript {
    let variable_file_names = group
        .referenced_variables()
        .into_iter()
        .map(|name| variable_file_name(group.index, &name))
        .collect();
    Jobscript {
        header: JobscriptHeader {
            working_dir: options.directory,
            modules: options.modules,
            scheduler_options: options.options,
            job_array: options.job_array,
            array_len: task_indices.len().max(1),
        },
        body: JobscriptBody {
            command_group_index: group.index,
            variable_file_names,
            parallel_variables: group.parallel_variables,
        },
        variable_dir: variable_dir.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_zero_pad_width_boundary_9_vs_10() {
        assert_eq!(zero_pad_width(9), 1);
        assert_eq!(zero_pad_width(10), 2);
        assert_eq!(pad_index(9, zero_pad_width(9)), "9");
        assert_eq!(pad_index(9, zero_pad_width(10)), "09");
    }

    #[test]
    fn t_zero_pad_width_single_task() {
        assert_eq!(zero_pad_width(1), 1);
        assert_eq!(pad_index(0, zero_pad_width(1)), "0");
    }

    #[test]
    fn t_distribute_preserves_total_and_balances() {
        let counts = distribute_into_subdirs(17, 5);
        assert_eq!(counts.iter().sum::<usize>(), 17);
        let max = *counts.iter().max().unwrap();
        let min = *counts.iter().min().unwrap();
        assert!(max - min <= 1);
    }

    #[test]
    fn t_distribute_deterministic() {
        let a = distribute_into_subdirs(103, 7);
        let b = distribute_into_subdirs(103, 7);
        assert_eq!(a, b);
    }

    #[test]
    fn t_write_variable_files_one_line_per_row() {
        let dir = tempfile::tempdir().unwrap();
        let group = CommandGroup {
            index: 0,
            exec_order: 0,
            sub_order: 0,
            commands: vec!["postProcess <<f>>".to_string()],
            overrides: Default::default(),
            parallel_variables: false,
            profile_name: None,
            profile_order: None,
        };
        let rows: Vec<Row> = ["a", "b", "c"]
            .iter()
            .map(|v| [("f".to_string(), v.to_string())].into_iter().collect())
            .collect();
        let paths = write_variable_files(&group, &rows, dir.path()).unwrap();
        assert_eq!(paths.len(), 1);
        let content = std::fs::read_to_string(&paths[0]).unwrap();
        assert_eq!(content, "a\nb\nc\n");
    }
}
