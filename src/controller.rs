//! The submission controller (§4.7): the one layer that touches every
//! other module — declaration validation, the store, the variable
//! resolver, the channel scheduler, the jobscript emitter, and the
//! scheduler bridge.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    time::SystemTime,
};

use anyhow::Context;

use crate::{
    bridge::SchedulerBridge,
    channel,
    channel::TaskRange,
    command_group::CommandGroup,
    declaration::WorkflowDecl,
    ids::{SubmissionId, WorkflowId},
    jobscript,
    lockable_file::StandaloneExclusiveFileLock,
    resolver::Resolver,
    store::Store,
    template,
};

pub struct Controller<'b> {
    pub store: Store,
    pub bridge: &'b dyn SchedulerBridge,
}

impl<'b> Controller<'b> {
    pub fn new(store: Store, bridge: &'b dyn SchedulerBridge) -> Self {
        Self { store, bridge }
    }

    /// `make_workflow` (§4.7): validates and persists. Takes an
    /// exclusive lock on a marker file under `working_dir` for the
    /// duration of the call, the same `StandaloneExclusiveFileLock`
    /// mechanism `store::archive` uses — concurrent `make_workflow`
    /// calls against the same `working_dir` serialize rather than
    /// racing to insert independent workflow rows.
    pub fn make_workflow(
        &self,
        decl: WorkflowDecl,
        working_dir: PathBuf,
    ) -> anyhow::Result<WorkflowId> {
        std::fs::create_dir_all(&working_dir)
            .with_context(|| format!("creating working directory {working_dir:?}"))?;
        let lock_path = working_dir.join(".batchflow-make.lock");
        let _lock = StandaloneExclusiveFileLock::lock_path(&lock_path)
            .with_context(|| format!("locking {lock_path:?} for make_workflow"))?;

        let (command_groups, variables, profile_defaults) = decl.into_parts()?;
        let id = self.store.insert_workflow_with_defaults(
            working_dir,
            command_groups,
            variables,
            profile_defaults,
            SystemTime::now(),
        )?;
        Ok(id)
    }

    /// `submit_workflow` (§4.7): schedules channels, resolves
    /// Phase-A variables, emits jobscripts and variable files, then
    /// dispatches in `(exec_order, sub_order, declaration)` order
    /// (§5) with hold dependencies drawn from already-dispatched
    /// groups. A dispatch failure partway through leaves undispatched
    /// groups `Pending` in the persisted submission (§7 taxonomy #4).
    /// Calling this again with the same `workflow_id`/`ranges` finds
    /// that submission via `Store::find_resumable_submission` and
    /// resumes it: already-`Dispatched` groups are neither
    /// re-scheduled into new task rows nor re-dispatched, only the
    /// still-`Pending` ones are (§8 uniqueness).
    pub fn submit_workflow(
        &self,
        workflow_id: WorkflowId,
        ranges: Option<Vec<TaskRange>>,
        jobscripts_dir: &Path,
    ) -> anyhow::Result<SubmissionId> {
        let workflow = self.store.get_workflow(workflow_id)?;
        let resolver = Resolver::new(&workflow.variables, &workflow.working_dir);

        let variable_product_len = |group: &CommandGroup| {
            let refs = group.referenced_variables();
            if refs.is_empty() {
                return None;
            }
            resolver.resolve_many(&refs).ok().flatten().map(|rows| rows.len())
        };

        let scheduled = channel::schedule(
            &workflow.command_groups,
            ranges.as_deref(),
            variable_product_len,
        )?;

        let resumed = self
            .store
            .find_resumable_submission(workflow_id, &ranges)?;
        let submission_id = match resumed {
            Some(id) => id,
            None => {
                self.store
                    .create_submission(workflow_id, ranges, scheduled.clone(), SystemTime::now())?
            }
        };

        let submission = self.store.get_submission(workflow_id, submission_id)?;
        let mut handles: HashMap<usize, String> = HashMap::new();
        let mut pending_indices: std::collections::HashSet<usize> = std::collections::HashSet::new();
        for group in &submission.groups {
            match &group.scheduler_handle {
                Some(handle) => {
                    handles.insert(group.scheduled.group_index, handle.clone());
                }
                None => {
                    pending_indices.insert(group.scheduled.group_index);
                }
            }
        }

        for scheduled_group in &scheduled {
            if !pending_indices.contains(&scheduled_group.group_index) {
                continue;
            }
            let group = &workflow.command_groups[scheduled_group.group_index];

            self.store.create_tasks(
                workflow_id,
                None,
                group.index,
                &scheduled_group.task_indices,
            )?;

            let refs = group.referenced_variables();
            let rows = if refs.is_empty() {
                Vec::new()
            } else {
                resolver.resolve_many(&refs)?.unwrap_or_default()
            };

            let variable_dir = jobscripts_dir.join(format!("group-{}", group.index));
            jobscript::write_variable_files(group, &rows, &variable_dir)?;

            let resolved_options = group.resolve_options(&workflow.profile_defaults, None);
            let description = jobscript::emit(
                group,
                &scheduled_group.task_indices,
                resolved_options,
                &variable_dir,
            );

            let script_path = jobscripts_dir.join(format!("group-{}.sh", group.index));
            let holds: Vec<String> = scheduled_group
                .depends_on
                .iter()
                .filter_map(|idx| handles.get(idx).cloned())
                .collect();

            let handle = self.bridge.dispatch(&description, &script_path, &holds)?;
            self.store
                .mark_group_dispatched(workflow_id, submission_id, group.index, handle.clone())?;
            handles.insert(group.index, handle);
        }

        Ok(submission_id)
    }

    /// `write_cmd` (§4.7): the runtime operation a jobscript invokes
    /// per task index. Pure given `(workflow, command_group_index,
    /// task_index)` and working-directory state (§8's round-trip
    /// property): called twice, it writes identical bytes.
    pub fn write_cmd(
        &self,
        workflow_id: WorkflowId,
        command_group_index: usize,
        task_index: usize,
        out_path: &Path,
    ) -> anyhow::Result<()> {
        let workflow = self.store.get_workflow(workflow_id)?;
        let group = workflow
            .command_groups
            .get(command_group_index)
            .ok_or_else(|| anyhow::anyhow!("no command group at index {command_group_index}"))?;

        let resolver = Resolver::new(&workflow.variables, &workflow.working_dir);
        let refs = group.referenced_variables();
        let rows = if refs.is_empty() {
            Vec::new()
        } else {
            resolver.resolve_many(&refs)?.ok_or_else(|| {
                anyhow::anyhow!(
                    "command group {command_group_index} has unresolved (deferred) variables at runtime"
                )
            })?
        };

        let empty_row = crate::resolver::Row::new();
        let row = if rows.is_empty() {
            &empty_row
        } else {
            rows.get(task_index).ok_or_else(|| {
                anyhow::anyhow!(
                    "task index {task_index} out of bounds for command group {command_group_index}"
                )
            })?
        };

        let rendered: Vec<String> = group
            .commands
            .iter()
            .map(|command| template::substitute(command, row))
            .collect();
        let mut content = rendered.join("\n");
        content.push('\n');
        std::fs::write(out_path, content)?;
        Ok(())
    }

    /// `kill` (§4.7, §5): cancels every non-terminal task owned by
    /// `workflow_id` — terminal tasks untouched, `running` tasks get
    /// an end timestamp, everything else gets `reason`.
    pub fn kill(&self, workflow_id: WorkflowId, reason: &str) -> anyhow::Result<()> {
        let tasks = self.store.tasks(workflow_id, false)?;
        let now = SystemTime::now();
        for key in tasks.sorted_keys(false, None)? {
            self.store
                .cancel_task(workflow_id, key, reason.to_string(), now)?;
        }
        Ok(())
    }

    /// `clean` (§4.7): removes the jobscripts/variable-files
    /// directory this controller wrote. User confirmation is a
    /// CLI-layer concern (§1).
    pub fn clean(&self, jobscripts_dir: &Path) -> anyhow::Result<()> {
        if jobscripts_dir.is_dir() {
            std::fs::remove_dir_all(jobscripts_dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bridge::LocalDirectBridge, declaration::CommandGroupDecl, variable::Variable};
    use std::collections::HashMap as Map;

    fn group(commands: Vec<&str>) -> CommandGroupDecl {
        CommandGroupDecl {
            commands: commands.into_iter().map(String::from).collect(),
            exec_order: Some(0),
            sub_order: Some(0),
            options: None,
            directory: None,
            modules: None,
            job_array: None,
            parallel: None,
            profile_name: None,
            profile_order: None,
        }
    }

    #[test]
    fn t_s1_make_submit_write_cmd() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::create_all(dir.path().join("store")).unwrap();
        let bridge = LocalDirectBridge;
        let controller = Controller::new(store, &bridge);

        let mut variables = Map::new();
        variables.insert(
            "f".to_string(),
            Variable::new("f", "{:s}").with_data(vec![
                "a".to_string(),
                "b".to_string(),
                "c".to_string(),
                "d".to_string(),
                "e".to_string(),
            ]),
        );
        let decl = WorkflowDecl {
            profile: "s1".to_string(),
            command_groups: vec![group(vec!["postProcess <<f>>"])],
            variables,
            options: None,
            directory: None,
            modules: None,
            job_array: None,
            profile_order: None,
            profile_name: None,
        };

        let working_dir = dir.path().join("work");
        std::fs::create_dir_all(&working_dir).unwrap();
        let workflow_id = controller
            .make_workflow(decl, working_dir.clone())
            .unwrap();

        let jobscripts_dir = dir.path().join("jobscripts");
        std::fs::create_dir_all(&jobscripts_dir).unwrap();
        // LocalDirectBridge tries to run a script file that doesn't
        // exist at this path in the test, so give it something to run.
        std::fs::write(jobscripts_dir.join("group-0.sh"), "#!/bin/sh\nexit 0\n").unwrap();

        let submission_id = controller
            .submit_workflow(workflow_id, None, &jobscripts_dir)
            .unwrap();
        let submission = controller
            .store
            .get_submission(workflow_id, submission_id)
            .unwrap();
        assert_eq!(submission.groups.len(), 1);
        assert_eq!(submission.groups[0].scheduled.task_indices.len(), 5);

        let out_path = dir.path().join("task-0.cmd");
        controller
            .write_cmd(workflow_id, 0, 0, &out_path)
            .unwrap();
        let first = std::fs::read_to_string(&out_path).unwrap();
        assert_eq!(first, "postProcess a\n");

        // Pure: calling again writes identical bytes.
        controller
            .write_cmd(workflow_id, 0, 0, &out_path)
            .unwrap();
        let second = std::fs::read_to_string(&out_path).unwrap();
        assert_eq!(first, second);
    }

    /// Fails `dispatch` for one chosen group index exactly once, then
    /// succeeds on every later call — standing in for a scheduler
    /// bridge that rejects a submission partway through.
    struct FlakyBridge {
        fail_group: usize,
        failed_once: std::cell::Cell<bool>,
    }

    impl SchedulerBridge for FlakyBridge {
        fn dispatch(
            &self,
            jobscript: &crate::jobscript::Jobscript,
            script_path: &Path,
            holds: &[String],
        ) -> Result<String, crate::error::SchedulerBridgeError> {
            if jobscript.body.command_group_index == self.fail_group && !self.failed_once.get() {
                self.failed_once.set(true);
                return Err(crate::error::SchedulerBridgeError::Rejected {
                    bridge: "flaky",
                    reason: "simulated transient failure".to_string(),
                });
            }
            LocalDirectBridge.dispatch(jobscript, script_path, holds)
        }

        fn cancel(&self, handle: &str) -> Result<(), crate::error::SchedulerBridgeError> {
            LocalDirectBridge.cancel(handle)
        }
    }

    #[test]
    fn t_retried_submit_resumes_instead_of_duplicating() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::create_all(dir.path().join("store")).unwrap();
        let bridge = FlakyBridge {
            fail_group: 1,
            failed_once: std::cell::Cell::new(false),
        };
        let controller = Controller::new(store, &bridge);

        let mut variables = Map::new();
        variables.insert(
            "f".to_string(),
            Variable::new("f", "{:s}").with_data(vec!["a".to_string(), "b".to_string()]),
        );
        let mut group1 = group(vec!["postProcess <<f>>"]);
        group1.sub_order = Some(1);
        let decl = WorkflowDecl {
            profile: "retry".to_string(),
            command_groups: vec![group(vec!["run <<f>>"]), group1],
            variables,
            options: None,
            directory: None,
            modules: None,
            job_array: None,
            profile_order: None,
            profile_name: None,
        };

        let working_dir = dir.path().join("work");
        std::fs::create_dir_all(&working_dir).unwrap();
        let workflow_id = controller.make_workflow(decl, working_dir).unwrap();

        let jobscripts_dir = dir.path().join("jobscripts");
        std::fs::create_dir_all(&jobscripts_dir).unwrap();
        std::fs::write(jobscripts_dir.join("group-0.sh"), "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::write(jobscripts_dir.join("group-1.sh"), "#!/bin/sh\nexit 0\n").unwrap();

        // First call: group 0 dispatches, group 1 fails and the whole
        // call surfaces that error.
        controller
            .submit_workflow(workflow_id, None, &jobscripts_dir)
            .unwrap_err();

        let tasks_after_first = controller.store.tasks(workflow_id, false).unwrap();
        assert_eq!(tasks_after_first.sorted_keys(false, None).unwrap().len(), 4);

        // Retry with the same ranges: resumes the same submission,
        // only (re)dispatches group 1, and does not mint duplicate
        // task rows for group 0 or group 1.
        let submission_id = controller
            .submit_workflow(workflow_id, None, &jobscripts_dir)
            .unwrap();

        let submissions = controller.store.submissions(workflow_id, false).unwrap();
        assert_eq!(submissions.sorted_keys(false, None).unwrap().len(), 1);

        let submission = controller
            .store
            .get_submission(workflow_id, submission_id)
            .unwrap();
        assert!(submission
            .groups
            .iter()
            .all(|g| g.status == crate::store::submission::DispatchStatus::Dispatched));

        let tasks_after_retry = controller.store.tasks(workflow_id, false).unwrap();
        assert_eq!(tasks_after_retry.sorted_keys(false, None).unwrap().len(), 4);
    }
}
