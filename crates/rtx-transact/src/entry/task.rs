use std::collections::BTreeMap;

use rtx_store::TaskRecord;
use rtx_types::{ResourceId, TaskId};

use crate::error::{TransactError, TransactResult};
use crate::journal::MutableEntry;

static NO_TASKS: BTreeMap<TaskId, u64> = BTreeMap::new();

#[derive(Debug)]
enum Strategy {
    Absent,
    ReadOnly(TaskRecord),
    CopyOnWrite {
        original: TaskRecord,
        tasks: Option<BTreeMap<TaskId, u64>>,
    },
}

/// The scheduled tasks of one resource as seen by a snapshot.
#[derive(Debug)]
pub struct TaskEntry {
    resource_id: ResourceId,
    strategy: Strategy,
}

impl TaskEntry {
    /// Task entry of a resource that does not exist.
    pub fn absent(resource_id: ResourceId) -> Self {
        Self {
            resource_id,
            strategy: Strategy::Absent,
        }
    }

    pub fn read_only(record: TaskRecord) -> Self {
        Self {
            resource_id: record.resource_id,
            strategy: Strategy::ReadOnly(record),
        }
    }

    pub fn copy_on_write(record: TaskRecord) -> Self {
        Self {
            resource_id: record.resource_id,
            strategy: Strategy::CopyOnWrite {
                original: record,
                tasks: None,
            },
        }
    }

    pub fn resource_id(&self) -> &ResourceId {
        &self.resource_id
    }

    pub fn is_present(&self) -> bool {
        !matches!(self.strategy, Strategy::Absent)
    }

    /// Each task and its fire time in milliseconds since the Unix epoch.
    pub fn tasks(&self) -> &BTreeMap<TaskId, u64> {
        match &self.strategy {
            Strategy::Absent => &NO_TASKS,
            Strategy::ReadOnly(record) => &record.tasks,
            Strategy::CopyOnWrite { tasks: Some(tasks), .. } => tasks,
            Strategy::CopyOnWrite { original, .. } => &original.tasks,
        }
    }

    pub fn is_original(&self) -> bool {
        !matches!(self.strategy, Strategy::CopyOnWrite { tasks: Some(_), .. })
    }

    fn overlay(&mut self) -> TransactResult<&mut BTreeMap<TaskId, u64>> {
        match &mut self.strategy {
            Strategy::Absent => Err(TransactError::resource_not_found(&self.resource_id)),
            Strategy::ReadOnly(_) => Err(TransactError::Protocol(format!(
                "tasks of {} are read-only in this transaction",
                self.resource_id
            ))),
            Strategy::CopyOnWrite { original, tasks } => {
                Ok(tasks.get_or_insert_with(|| original.tasks.clone()))
            }
        }
    }

    /// Schedule `task` at `fire_at` (replacing any earlier time).
    pub fn put(&mut self, task: TaskId, fire_at: u64) -> TransactResult<()> {
        if task.resource_id() != &self.resource_id {
            return Err(TransactError::InvalidArgument(format!(
                "task {task} does not belong to {}",
                self.resource_id
            )));
        }
        self.overlay()?.insert(task, fire_at);
        Ok(())
    }

    /// Remove `task`. Returns `false` if it was not scheduled.
    pub fn remove(&mut self, task: &TaskId) -> TransactResult<bool> {
        if !self.tasks().contains_key(task) {
            return Ok(false);
        }
        Ok(self.overlay()?.remove(task).is_some())
    }

    /// Remove every task. Returns `false` if there were none.
    pub fn delete(&mut self) -> TransactResult<bool> {
        if self.tasks().is_empty() {
            return Ok(false);
        }
        self.overlay()?.clear();
        Ok(true)
    }

    /// Stage the task set in the journal if it changed. An empty set deletes
    /// the stored entry.
    pub fn flush(&self, journal: &mut MutableEntry) -> TransactResult<()> {
        if let Strategy::CopyOnWrite {
            original,
            tasks: Some(tasks),
        } = &self.strategy
        {
            if tasks != &original.tasks {
                journal.apply_task_change(&self.resource_id, tasks)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtx_types::NodeId;

    fn resource() -> ResourceId {
        ResourceId::new(NodeId::random())
    }

    #[test]
    fn copy_on_write_leaves_original_untouched() {
        let id = resource();
        let task = TaskId::new(id);
        let mut record = TaskRecord::empty(id);
        record.tasks.insert(task, 10);

        let mut entry = TaskEntry::copy_on_write(record);
        assert!(entry.is_original());
        entry.put(TaskId::new(id), 20).unwrap();
        assert!(!entry.is_original());
        assert_eq!(entry.tasks().len(), 2);

        assert!(entry.remove(&task).unwrap());
        assert!(!entry.remove(&task).unwrap());
        assert!(entry.delete().unwrap());
        assert!(entry.tasks().is_empty());
    }

    #[test]
    fn foreign_task_is_rejected() {
        let mut entry = TaskEntry::copy_on_write(TaskRecord::empty(resource()));
        assert!(matches!(
            entry.put(TaskId::new(resource()), 1),
            Err(TransactError::InvalidArgument(_))
        ));
    }

    #[test]
    fn absent_and_read_only_reject_mutation() {
        let id = resource();
        let mut absent = TaskEntry::absent(id);
        assert!(matches!(
            absent.put(TaskId::new(id), 1),
            Err(TransactError::NotFound(_))
        ));
        assert!(!absent.delete().unwrap());

        let mut read_only = TaskEntry::read_only(TaskRecord::empty(id));
        assert!(matches!(
            read_only.put(TaskId::new(id), 1),
            Err(TransactError::Protocol(_))
        ));
    }
}
