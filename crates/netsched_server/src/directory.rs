//! Queue directory: name -> queue map, queue classes, dynamic lifecycle.

use chrono::{DateTime, Duration, Utc};
use netsched_protocol::{ErrKind, JobId, NsError, QueueParams, ServerParams};
use netsched_queue::{Datagram, Journal, Queue, QueueContext};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

struct DirInner {
    queues: HashMap<String, Arc<Queue>>,
    classes: HashMap<String, QueueParams>,
    /// Names created via QCRE; only these may be deleted.
    dynamic: HashMap<String, String>, // name -> class
    /// Deleted dynamic queues still draining their purge; the name is
    /// reserved until the record store empties.
    doomed: HashMap<String, Arc<Queue>>,
    /// Empty-since timestamps for dynamic queues with an empty_lifetime.
    empty_since: HashMap<String, DateTime<Utc>>,
}

/// Holds every addressable queue. Static queues come from configuration;
/// dynamic ones are created against a class template and may be deleted
/// once drained. The two server-wide gates live here as atomics read at
/// command entry.
pub struct QueueDirectory {
    ctx: QueueContext,
    notify_tx: Sender<Datagram>,
    journal: Arc<dyn Journal>,
    inner: Mutex<DirInner>,
    refuse_submits: AtomicBool,
    shutting_down: AtomicBool,
}

impl QueueDirectory {
    pub fn from_config(
        params: &ServerParams,
        ctx: QueueContext,
        notify_tx: Sender<Datagram>,
        journal: Arc<dyn Journal>,
    ) -> Self {
        let mut queues = HashMap::new();
        for (name, queue_params) in &params.queues {
            let queue = Arc::new(Queue::new(
                name.clone(),
                queue_params.clone(),
                ctx.clone(),
                notify_tx.clone(),
                Arc::clone(&journal),
            ));
            queues.insert(name.clone(), queue);
        }
        info!(queues = queues.len(), classes = params.classes.len(), "Queue directory loaded");

        Self {
            ctx,
            notify_tx,
            journal,
            inner: Mutex::new(DirInner {
                queues,
                classes: params.classes.clone(),
                dynamic: HashMap::new(),
                doomed: HashMap::new(),
                empty_since: HashMap::new(),
            }),
            refuse_submits: AtomicBool::new(params.refuse_submits),
            shutting_down: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DirInner> {
        self.inner.lock().expect("directory lock poisoned")
    }

    pub fn get(&self, name: &str) -> Option<Arc<Queue>> {
        self.lock().queues.get(name).cloned()
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.lock().queues.keys().cloned().collect()
    }

    /// Every queue the background threads must service, doomed ones
    /// included (they still need purging to drain).
    pub fn all_queues(&self) -> Vec<Arc<Queue>> {
        let inner = self.lock();
        inner
            .queues
            .values()
            .chain(inner.doomed.values())
            .cloned()
            .collect()
    }

    /// QCRE: instantiate a dynamic queue from a class template.
    pub fn create_dynamic(
        &self,
        qname: &str,
        qclass: &str,
        description: Option<&str>,
    ) -> Result<(), NsError> {
        let mut inner = self.lock();
        if inner.queues.contains_key(qname) {
            // Re-creating an existing dynamic queue of the same class is a
            // no-op; clashing with a static queue is an error.
            if inner.dynamic.get(qname).map(String::as_str) == Some(qclass) {
                return Ok(());
            }
            return Err(NsError::invalid_parameter(format!(
                "Queue '{}' already exists",
                qname
            )));
        }
        if inner.doomed.contains_key(qname) {
            return Err(NsError::new(
                ErrKind::TryAgain,
                format!("Queue name '{}' is still being purged", qname),
            ));
        }
        let Some(template) = inner.classes.get(qclass).cloned() else {
            return Err(NsError::invalid_parameter(format!(
                "Queue class '{}' is not configured",
                qclass
            )));
        };
        let mut params = template;
        if let Some(description) = description {
            params.description = description.to_string();
        }
        let queue = Arc::new(Queue::new(
            qname.to_string(),
            params,
            self.ctx.clone(),
            self.notify_tx.clone(),
            Arc::clone(&self.journal),
        ));
        inner.queues.insert(qname.to_string(), queue);
        inner.dynamic.insert(qname.to_string(), qclass.to_string());
        info!(queue = qname, class = qclass, "Dynamic queue created");
        Ok(())
    }

    /// QDEL: remove a dynamic queue. Refused while non-terminal jobs remain;
    /// the name stays reserved until the purge drains the record store.
    pub fn delete_dynamic(&self, qname: &str) -> Result<(), NsError> {
        let mut inner = self.lock();
        if !inner.dynamic.contains_key(qname) {
            return Err(if inner.queues.contains_key(qname) {
                NsError::access_denied(format!("Queue '{}' is static and cannot be deleted", qname))
            } else {
                NsError::unknown_queue(qname)
            });
        }
        let queue = inner.queues.get(qname).cloned().expect("dynamic queue in map");
        if queue.non_terminal_count() > 0 {
            return Err(NsError::new(
                ErrKind::TryAgain,
                format!("Queue '{}' still has unfinished jobs", qname),
            ));
        }
        inner.queues.remove(qname);
        inner.dynamic.remove(qname);
        inner.empty_since.remove(qname);
        inner.doomed.insert(qname.to_string(), queue);
        info!(queue = qname, "Dynamic queue deleted; purge pending");
        Ok(())
    }

    /// Locate another queue holding `job_id`; used for MPUT/MGET keys that
    /// re-resolve outside the handshake queue.
    pub fn find_job_queue(&self, job_id: JobId, exclude: &str) -> Option<Arc<Queue>> {
        let inner = self.lock();
        inner
            .queues
            .iter()
            .filter(|(name, _)| name.as_str() != exclude)
            .map(|(_, q)| q)
            .find(|q| q.holds_job(job_id))
            .cloned()
    }

    /// Directory-side maintenance, driven by the purge thread: release
    /// drained doomed queues and expire empty dynamic queues.
    pub fn maintain(&self, now: DateTime<Utc>) {
        let mut inner = self.lock();

        inner.doomed.retain(|name, queue| {
            queue.purge(now, usize::MAX);
            let drained = !queue.holds_any();
            if drained {
                info!(queue = name.as_str(), "Doomed queue drained; name released");
            }
            !drained
        });

        // Expire dynamic queues that stayed empty past their lifetime.
        let mut expired = Vec::new();
        for (name, _) in inner.dynamic.clone() {
            let Some(queue) = inner.queues.get(&name) else { continue };
            let lifetime = queue.params().empty_lifetime;
            if lifetime == 0 {
                continue;
            }
            if queue.holds_any() {
                inner.empty_since.remove(&name);
                continue;
            }
            let since = *inner.empty_since.entry(name.clone()).or_insert(now);
            if since + Duration::seconds(lifetime as i64) <= now {
                expired.push(name.clone());
            }
        }
        for name in expired {
            warn!(queue = name.as_str(), "Empty dynamic queue expired");
            inner.queues.remove(&name);
            inner.dynamic.remove(&name);
            inner.empty_since.remove(&name);
        }
    }

    // ------------------------------------------------------------------
    // Server-wide gates
    // ------------------------------------------------------------------

    pub fn refuse_submits(&self) -> bool {
        self.refuse_submits.load(Ordering::Relaxed)
    }

    pub fn set_refuse_submits(&self, refuse: bool) {
        self.refuse_submits.store(refuse, Ordering::Relaxed);
    }

    pub fn shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Controlled shutdown: refuse new submits, then drain.
    pub fn begin_shutdown(&self) {
        self.refuse_submits.store(true, Ordering::Relaxed);
        self.shutting_down.store(true, Ordering::Relaxed);
    }

    pub fn node_id(&self) -> &str {
        &self.ctx.node_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsched_queue::NullJournal;
    use std::sync::mpsc;

    fn test_directory() -> QueueDirectory {
        let mut params = ServerParams::default();
        params.queues.insert("main".to_string(), QueueParams::default());
        params.classes.insert(
            "fast".to_string(),
            QueueParams {
                run_timeout: 1,
                ..QueueParams::default()
            },
        );
        let (tx, _rx) = mpsc::channel();
        QueueDirectory::from_config(
            &params,
            QueueContext {
                node_id: "node1".to_string(),
                host: "127.0.0.1".to_string(),
                port: 9100,
            },
            tx,
            Arc::new(NullJournal),
        )
    }

    #[test]
    fn test_static_queues_resolve() {
        let dir = test_directory();
        assert!(dir.get("main").is_some());
        assert!(dir.get("missing").is_none());
    }

    #[test]
    fn test_dynamic_create_and_delete() {
        let dir = test_directory();
        dir.create_dynamic("dyn1", "fast", Some("scratch")).unwrap();
        let queue = dir.get("dyn1").unwrap();
        assert_eq!(queue.params().run_timeout, 1);
        assert_eq!(queue.params().description, "scratch");

        // Unknown class is rejected.
        let err = dir.create_dynamic("dyn2", "nope", None).unwrap_err();
        assert_eq!(err.kind, ErrKind::InvalidParameter);

        dir.delete_dynamic("dyn1").unwrap();
        assert!(dir.get("dyn1").is_none());

        // The name is reserved until the doomed queue drains.
        let err = dir.create_dynamic("dyn1", "fast", None).unwrap_err();
        assert_eq!(err.kind, ErrKind::TryAgain);

        dir.maintain(Utc::now());
        dir.create_dynamic("dyn1", "fast", None).unwrap();
    }

    #[test]
    fn test_delete_refuses_static_and_busy() {
        let dir = test_directory();
        let err = dir.delete_dynamic("main").unwrap_err();
        assert_eq!(err.kind, ErrKind::AccessDenied);

        dir.create_dynamic("dyn1", "fast", None).unwrap();
        let queue = dir.get("dyn1").unwrap();
        let client = netsched_queue::ClientId::new("n", "s", "127.0.0.1");
        queue
            .submit(
                &client,
                netsched_queue::SubmitSpec {
                    input: b"x".to_vec(),
                    ..netsched_queue::SubmitSpec::default()
                },
                Utc::now(),
            )
            .unwrap();
        let err = dir.delete_dynamic("dyn1").unwrap_err();
        assert_eq!(err.kind, ErrKind::TryAgain);
    }

    #[test]
    fn test_server_gates() {
        let dir = test_directory();
        assert!(!dir.refuse_submits());
        dir.begin_shutdown();
        assert!(dir.refuse_submits());
        assert!(dir.shutting_down());
    }
}
