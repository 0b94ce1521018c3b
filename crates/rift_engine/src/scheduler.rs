use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rayon::prelude::*;
use rift_core::jobs::JobSystem;
use rift_core::tasks::TaskSender;
use rift_shared::block::BlockRegistry;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::engine::ApplyState;
use crate::error::EngineError;
use crate::host::{ClientFrame, ClientId, HostFrame};
use crate::linker::PortalLinker;
use crate::session::{ClientPortalSession, SessionOutput};

/// Owns every client session and computes one [`HostFrame`] at a time.
/// Results leave only as tasks for the host thread.
pub struct Worker {
    config: Arc<EngineConfig>,
    blocks: Arc<BlockRegistry>,
    linker: Arc<dyn PortalLinker>,
    jobs: JobSystem,
    tasks: TaskSender<ApplyState>,
    sessions: FxHashMap<ClientId, ClientPortalSession>,
}

impl Worker {
    pub fn new(
        config: Arc<EngineConfig>,
        blocks: Arc<BlockRegistry>,
        linker: Arc<dyn PortalLinker>,
        jobs: JobSystem,
        tasks: TaskSender<ApplyState>,
    ) -> Self {
        Self {
            config,
            blocks,
            linker,
            jobs,
            tasks,
            sessions: FxHashMap::default(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn tick(&mut self, frame: HostFrame) {
        let present: FxHashSet<ClientId> =
            frame.clients.iter().map(|client| client.view.id).collect();

        let mut departed: Vec<ClientId> = self
            .sessions
            .keys()
            .filter(|id| !present.contains(*id))
            .copied()
            .collect();
        departed.sort_unstable();
        for id in departed {
            let Some(mut session) = self.sessions.remove(&id) else {
                continue;
            };
            let messages = session.tear_down();
            debug!("Tore down portal session for client {id}");
            self.tasks.submit(move |state: &mut ApplyState| {
                state.queue(id, messages);
                state.forget(id);
            });
        }

        for client in &frame.clients {
            let id = client.view.id;
            if !self.sessions.contains_key(&id) {
                debug!("Created portal session for client {id}");
                self.sessions.insert(
                    id,
                    ClientPortalSession::new(
                        id,
                        self.config.clone(),
                        self.blocks.clone(),
                        self.linker.clone(),
                    ),
                );
            }
        }

        let frames: FxHashMap<ClientId, &ClientFrame> = frame
            .clients
            .iter()
            .map(|client| (client.view.id, client))
            .collect();
        let tick = frame.tick;
        let mut work: Vec<(&mut ClientPortalSession, &ClientFrame)> = self
            .sessions
            .iter_mut()
            .filter_map(|(id, session)| frames.get(id).map(|client| (session, *client)))
            .collect();
        work.sort_unstable_by_key(|(session, _)| session.client());

        let results: Vec<(ClientId, Option<SessionOutput>)> = self.jobs.install(|| {
            work.into_par_iter()
                .map(|(session, client)| (session.client(), run_session(session, client, tick)))
                .collect()
        });

        for (id, output) in results {
            let Some(output) = output else {
                continue;
            };
            if !self.tasks.submit(move |state: &mut ApplyState| state.publish(id, output)) {
                warn!("Host task queue closed; dropping output for client {id}");
            }
        }
    }
}

/// One session's tick, isolated so a fault skips only this client.
fn run_session(
    session: &mut ClientPortalSession,
    frame: &ClientFrame,
    tick: u64,
) -> Option<SessionOutput> {
    let id = session.client();
    match panic::catch_unwind(AssertUnwindSafe(|| session.tick(frame, tick))) {
        Ok(Ok(output)) => Some(output),
        Ok(Err(err)) => {
            error!("Portal session for client {id} failed on tick {tick}: {err}");
            None
        }
        Err(_) => {
            error!("Portal session for client {id} panicked on tick {tick}");
            None
        }
    }
}

/// Runs a [`Worker`] on its own thread at a fixed rate. Frames submitted
/// faster than the worker consumes them are merged, keeping the newest.
pub struct TickScheduler {
    frames: Option<Sender<HostFrame>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TickScheduler {
    pub fn spawn(worker: Worker, interval: Duration) -> Result<Self, EngineError> {
        let (tx, rx) = mpsc::channel();
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = thread::Builder::new()
            .name("rift-portal-worker".to_string())
            .spawn(move || run_worker(worker, rx, flag, interval))?;
        info!(
            "Portal worker started ({} ms per tick)",
            interval.as_millis()
        );
        Ok(Self {
            frames: Some(tx),
            running,
            handle: Some(handle),
        })
    }

    /// Hands a frame to the worker. Returns `false` once it has stopped.
    pub fn submit(&self, frame: HostFrame) -> bool {
        self.frames
            .as_ref()
            .is_some_and(|frames| frames.send(frame).is_ok())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.handle.is_some()
    }

    /// Signals the worker to exit and joins it.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.frames = None;
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Portal worker thread panicked");
            } else {
                info!("Portal worker stopped");
            }
        }
    }
}

impl Drop for TickScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(
    mut worker: Worker,
    frames: Receiver<HostFrame>,
    running: Arc<AtomicBool>,
    interval: Duration,
) {
    while running.load(Ordering::SeqCst) {
        let started = Instant::now();

        // Wait up to one interval for the first frame, then take the newest.
        let mut frame = match frames.recv_timeout(interval) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        for newer in frames.try_iter() {
            let older = std::mem::replace(&mut frame, newer);
            frame.absorb(older);
        }
        if !running.load(Ordering::SeqCst) {
            break;
        }

        worker.tick(frame);

        let elapsed = started.elapsed();
        if elapsed < interval {
            thread::sleep(interval - elapsed);
        } else {
            debug!(
                "Portal tick took {} ms (budget {} ms)",
                elapsed.as_millis(),
                interval.as_millis()
            );
        }
    }
    debug!(
        "Portal worker loop exiting with {} session(s)",
        worker.session_count()
    );
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use glam::{IVec3, Vec3};
    use rift_core::jobs::JobSystem;
    use rift_core::tasks::task_queue;
    use rift_shared::block::register_default_blocks;
    use rift_shared::coords::Axis;
    use rift_shared::entity::{
        AttributeValue, EntityId, EntityKind, EntitySnapshot, TrackedAttribute,
    };

    use super::{TickScheduler, Worker};
    use crate::config::EngineConfig;
    use crate::engine::ApplyState;
    use crate::host::{
        ClientFlags, ClientFrame, ClientView, HostFrame, Overwrites, WorldFrame, WorldId,
    };
    use crate::linker::{MatchingPortalLinker, PortalLinker, PortalShape};
    use crate::snapshot::VoxelSnapshotView;
    use crate::testkit::{build_portal, portal_cells, MemoryStore, RecordingSink};
    use crate::transform::CoordinateTransform;

    fn client_frame(world: u32, markers: Option<Vec<IVec3>>) -> ClientFrame {
        ClientFrame {
            view: ClientView {
                id: 1,
                world: WorldId(world),
                entity: EntityId(1000),
                eye: Vec3::new(0.5, 65.5, -4.0),
                yaw: 0.0,
                pitch: 0.0,
                flags: ClientFlags::ENABLED,
            },
            source: WorldFrame {
                id: WorldId(world),
                store: Arc::new(MemoryStore::new()),
            },
            destination: None,
            markers,
            nearby_entities: Vec::new(),
            destination_entities: Vec::new(),
            overwritten: Overwrites::default(),
        }
    }

    fn worker(tasks: rift_core::tasks::TaskSender<ApplyState>) -> Worker {
        let config = EngineConfig::default();
        let linker = MatchingPortalLinker::new(IVec3::ZERO, config.link_search_radius);
        worker_with(tasks, Arc::new(linker))
    }

    fn worker_with(
        tasks: rift_core::tasks::TaskSender<ApplyState>,
        linker: Arc<dyn PortalLinker>,
    ) -> Worker {
        Worker::new(
            Arc::new(EngineConfig::default()),
            Arc::new(register_default_blocks()),
            linker,
            JobSystem::new(Some(2), "test-portal").expect("job pool"),
            tasks,
        )
    }

    struct PanickingLinker;

    impl PortalLinker for PanickingLinker {
        fn link(
            &self,
            _shape: &PortalShape,
            _destination: &mut VoxelSnapshotView,
        ) -> Option<CoordinateTransform> {
            panic!("linker blew up");
        }
    }

    #[test]
    fn newer_frames_keep_markers_from_skipped_ones() {
        let markers = vec![IVec3::new(0, 65, 0)];
        let older = HostFrame {
            tick: 4,
            clients: vec![client_frame(0, Some(markers.clone()))],
        };
        let mut newer = HostFrame {
            tick: 5,
            clients: vec![client_frame(0, None)],
        };
        newer.absorb(older);
        assert_eq!(newer.tick, 5);
        assert_eq!(newer.clients[0].markers, Some(markers.clone()));

        // Markers from another world are stale and stay behind.
        let mut moved = HostFrame {
            tick: 6,
            clients: vec![client_frame(1, None)],
        };
        moved.absorb(HostFrame {
            tick: 5,
            clients: vec![client_frame(0, Some(markers))],
        });
        assert_eq!(moved.clients[0].markers, None);
    }

    #[test]
    fn attribute_changes_in_skipped_frames_survive() {
        let cow = |dirty: Vec<TrackedAttribute>| EntitySnapshot {
            dirty_attributes: dirty,
            ..EntitySnapshot::new(EntityId(7), EntityKind::Cow, Vec3::new(101.0, 65.0, 3.0))
        };
        let attribute = |key: u8, value: i32| TrackedAttribute {
            key,
            value: AttributeValue::Int(value),
        };

        let mut older = client_frame(0, None);
        older.destination_entities = vec![cow(vec![attribute(2, 5), attribute(3, 1)])];
        let mut newer = client_frame(0, None);
        newer.destination_entities = vec![cow(vec![attribute(3, 9)])];

        let mut frame = HostFrame {
            tick: 8,
            clients: vec![newer],
        };
        frame.absorb(HostFrame {
            tick: 7,
            clients: vec![older],
        });

        let mut dirty = frame.clients[0].destination_entities[0].dirty_attributes.clone();
        dirty.sort_by_key(|attribute| attribute.key);
        assert_eq!(dirty, vec![attribute(2, 5), attribute(3, 9)]);
    }

    #[test]
    fn sessions_follow_the_client_list() {
        let (sender, queue) = task_queue();
        let mut worker = worker(sender);
        let mut state = ApplyState::default();

        worker.tick(HostFrame {
            tick: 0,
            clients: vec![client_frame(0, Some(Vec::new()))],
        });
        assert_eq!(worker.session_count(), 1);
        assert_eq!(queue.drain(&mut state), 1);

        worker.tick(HostFrame::default());
        assert_eq!(worker.session_count(), 0);
        assert_eq!(queue.drain(&mut state), 1);
        assert_eq!(state.flush(&mut RecordingSink::with_clients(&[1])), 0);
    }

    #[test]
    fn a_panicking_session_does_not_stop_the_others() {
        let (sender, queue) = task_queue();
        let mut worker = worker_with(sender, Arc::new(PanickingLinker));

        let mut with_portal = MemoryStore::new();
        build_portal(&mut with_portal, IVec3::new(0, 64, 0), Axis::X, 2, 3, true);
        let mut failing = client_frame(0, Some(portal_cells(IVec3::new(0, 64, 0), Axis::X, 2, 3)));
        failing.source.store = Arc::new(with_portal);
        failing.destination = Some(WorldFrame {
            id: WorldId(1),
            store: Arc::new(MemoryStore::new()),
        });
        let mut healthy = client_frame(0, Some(Vec::new()));
        healthy.view.id = 2;

        let frame = HostFrame {
            tick: 0,
            clients: vec![failing.clone(), healthy.clone()],
        };
        worker.tick(frame);
        assert_eq!(worker.session_count(), 2);

        let mut state = ApplyState::default();
        assert_eq!(queue.drain(&mut state), 1);
        let mut sink = RecordingSink::with_clients(&[1, 2]);
        state.flush(&mut sink);
        assert_eq!(sink.near_portal.get(&2), Some(&false));
        assert!(!sink.near_portal.contains_key(&1));

        // The worker keeps going on the next tick.
        worker.tick(HostFrame {
            tick: 1,
            clients: vec![failing, healthy],
        });
        assert_eq!(queue.drain(&mut state), 1);
    }

    #[test]
    fn scheduler_stops_and_joins() {
        let (sender, queue) = task_queue();
        let mut scheduler =
            TickScheduler::spawn(worker(sender), Duration::from_millis(5)).expect("spawn");
        assert!(scheduler.is_running());
        assert!(scheduler.submit(HostFrame {
            tick: 0,
            clients: vec![client_frame(0, Some(Vec::new()))],
        }));

        scheduler.stop();
        assert!(!scheduler.is_running());
        assert!(!scheduler.submit(HostFrame::default()));

        // Whatever the worker managed to publish can still be drained.
        let mut state = ApplyState::default();
        assert!(queue.drain(&mut state) <= 1);
    }
}
