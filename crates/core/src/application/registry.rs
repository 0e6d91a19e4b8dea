// Job Registry - every known job, keyed by id

use crate::domain::{Job, JobId};
use crate::error::{AppError, Result};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: HashMap<JobId, Job>,
    next_seq: u64,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a QUEUED job for a descriptor
    ///
    /// # Errors
    /// - AppError::Conflict if a job for this descriptor is already registered
    pub fn create(&mut self, descriptor_path: &Path, now_millis: i64) -> Result<&mut Job> {
        let id = JobId::from_path(descriptor_path);
        match self.jobs.entry(id) {
            Entry::Occupied(entry) => Err(AppError::Conflict(format!(
                "job already registered: {}",
                entry.key()
            ))),
            Entry::Vacant(entry) => {
                self.next_seq += 1;
                Ok(entry.insert(Job::new(descriptor_path, self.next_seq, now_millis)))
            }
        }
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.jobs.contains_key(id)
    }

    pub fn get(&self, id: &JobId) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn get_mut(&mut self, id: &JobId) -> Option<&mut Job> {
        self.jobs.get_mut(id)
    }

    /// All jobs in arrival order
    pub fn list(&self) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.jobs.values().collect();
        jobs.sort_by_key(|j| j.seq);
        jobs
    }

    /// Non-terminal jobs in arrival order
    pub fn list_active(&self) -> Vec<&Job> {
        self.list()
            .into_iter()
            .filter(|j| j.state.is_active())
            .collect()
    }

    /// Remove a terminal job; the returned job is in REMOVED state
    ///
    /// # Errors
    /// - AppError::NotFound if the id is unknown
    /// - AppError::JobStillActive if the job is queued or running
    pub fn remove(&mut self, id: &JobId) -> Result<Job> {
        let job = self
            .jobs
            .get(id)
            .ok_or_else(|| AppError::NotFound(format!("job {id}")))?;
        if !job.state.is_terminal() {
            return Err(AppError::JobStillActive(id.clone()));
        }

        let mut job = self
            .jobs
            .remove(id)
            .ok_or_else(|| AppError::NotFound(format!("job {id}")))?;
        job.mark_removed()?;
        Ok(job)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobState;
    use std::path::PathBuf;

    #[test]
    fn test_create_and_lookup() {
        let mut registry = JobRegistry::new();
        let path = PathBuf::from("/pending/a.json");
        let id = registry.create(&path, 1000).unwrap().id.clone();

        let job = registry.get(&id).unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.seq, 1);
        assert!(registry.contains(&JobId::from_path(&path)));
    }

    #[test]
    fn test_duplicate_create_is_conflict() {
        let mut registry = JobRegistry::new();
        let path = PathBuf::from("/pending/a.json");
        registry.create(&path, 1000).unwrap();
        assert!(matches!(
            registry.create(&path, 2000),
            Err(AppError::Conflict(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_list_in_arrival_order_and_active_filter() {
        let mut registry = JobRegistry::new();
        for name in ["c", "a", "b"] {
            registry
                .create(&PathBuf::from(format!("/pending/{name}.json")), 1000)
                .unwrap();
        }
        let a = JobId::from_path(Path::new("/pending/a.json"));
        {
            let job = registry.get_mut(&a).unwrap();
            job.start(2000).unwrap();
            job.fail(3000, Some(1)).unwrap();
        }

        let names: Vec<_> = registry.list().iter().map(|j| j.name.clone()).collect();
        assert_eq!(names, vec!["c.json", "a.json", "b.json"]);

        let active: Vec<_> = registry
            .list_active()
            .iter()
            .map(|j| j.name.clone())
            .collect();
        assert_eq!(active, vec!["c.json", "b.json"]);
    }

    #[test]
    fn test_remove_rejects_active_job() {
        let mut registry = JobRegistry::new();
        let id = registry
            .create(Path::new("/pending/a.json"), 1000)
            .unwrap()
            .id
            .clone();

        assert!(matches!(
            registry.remove(&id),
            Err(AppError::JobStillActive(_))
        ));

        registry.get_mut(&id).unwrap().stop(2000).unwrap();
        let removed = registry.remove(&id).unwrap();
        assert_eq!(removed.state, JobState::Removed);
        assert!(registry.is_empty());
        assert!(matches!(registry.remove(&id), Err(AppError::NotFound(_))));
    }
}
