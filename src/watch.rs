use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{bounded, tick, Sender};

use crate::chan::{Post, PostId};
use crate::data::{CachedCatalogService, ThreadService};

pub const DEFAULT_PERIOD: Duration = Duration::from_secs(30);

/// What a live refresher does on each tick.
pub enum Mode {
    /// Re-fetch the open board's catalog (cache bypass, cache rewritten).
    Catalog { board: String },
    /// Check watched threads for posts newer than their watermarks.
    Watched { targets: Vec<WatchTarget> },
}

#[derive(Debug, Clone)]
pub struct WatchTarget {
    pub board: String,
    pub no: PostId,
    pub watermark: i64,
}

#[derive(Debug, Clone)]
pub struct ThreadUpdate {
    pub board: String,
    pub no: PostId,
    pub new_posts: usize,
    pub newest_time: i64,
}

/// Delivered on the UI's watch channel. `generation` lets the receiver drop
/// events from a refresher that has since been replaced.
pub enum Event {
    Catalog {
        generation: u64,
        board: String,
        result: Result<Vec<Post>>,
    },
    Watched {
        generation: u64,
        updates: Vec<ThreadUpdate>,
        failures: usize,
    },
}

pub struct Deps {
    pub catalogs: Arc<CachedCatalogService>,
    pub threads: Arc<dyn ThreadService>,
}

/// One background thread on a fixed tick. At most one lives at a time;
/// dropping it stops the thread before the next fetch begins.
pub struct Refresher {
    stop: Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
    generation: u64,
}

impl Refresher {
    pub fn start(
        mode: Mode,
        deps: Deps,
        period: Duration,
        generation: u64,
        tx: Sender<Event>,
    ) -> Self {
        let (stop_tx, stop_rx) = bounded(1);
        let ticker = tick(if period.is_zero() { DEFAULT_PERIOD } else { period });

        let handle = thread::spawn(move || loop {
            crossbeam_channel::select! {
                recv(stop_rx) -> _ => break,
                recv(ticker) -> msg => {
                    if msg.is_err() {
                        break;
                    }
                    match &mode {
                        Mode::Catalog { board } => {
                            let result = deps.catalogs.load_fresh(board);
                            if tx
                                .send(Event::Catalog {
                                    generation,
                                    board: board.clone(),
                                    result,
                                })
                                .is_err()
                            {
                                break;
                            }
                        }
                        Mode::Watched { targets } => {
                            let mut updates = Vec::new();
                            let mut failures = 0;
                            for target in targets {
                                match deps.threads.load_thread(&target.board, target.no) {
                                    Ok(thread) => {
                                        let newest = thread
                                            .posts
                                            .iter()
                                            .map(|post| post.time)
                                            .max()
                                            .unwrap_or(0);
                                        let fresh = thread
                                            .posts
                                            .iter()
                                            .filter(|post| post.time > target.watermark)
                                            .count();
                                        if fresh > 0 {
                                            updates.push(ThreadUpdate {
                                                board: target.board.clone(),
                                                no: target.no,
                                                new_posts: fresh,
                                                newest_time: newest,
                                            });
                                        }
                                    }
                                    Err(_) => failures += 1,
                                }
                            }
                            // quiet ticks send nothing
                            if (!updates.is_empty() || failures > 0)
                                && tx
                                    .send(Event::Watched {
                                        generation,
                                        updates,
                                        failures,
                                    })
                                    .is_err()
                            {
                                break;
                            }
                        }
                    }
                }
            }
        });

        Self {
            stop: stop_tx,
            handle: Some(handle),
            generation,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for Refresher {
    fn drop(&mut self) {
        let _ = self.stop.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chan::Thread;
    use crate::data::MockCatalogService;
    use crate::storage::{Options, Store};
    use anyhow::anyhow;
    use crossbeam_channel::unbounded;
    use tempfile::tempdir;

    fn cached_mock(dir: &tempfile::TempDir) -> Arc<CachedCatalogService> {
        let store = Store::open(Options {
            path: Some(dir.path().join("state.db")),
        })
        .unwrap();
        Arc::new(CachedCatalogService::new(
            Arc::new(MockCatalogService),
            store,
            Duration::from_secs(3600),
        ))
    }

    struct ScriptedThreads;

    impl ThreadService for ScriptedThreads {
        fn load_thread(&self, board: &str, no: PostId) -> Result<Thread> {
            if board == "bad" {
                return Err(anyhow!("boom"));
            }
            Ok(Thread {
                posts: vec![
                    Post {
                        no,
                        time: 1000,
                        ..Post::default()
                    },
                    Post {
                        no: no + 1,
                        time: 2000,
                        ..Post::default()
                    },
                ],
            })
        }
    }

    #[test]
    fn catalog_mode_delivers_fresh_lists() {
        let dir = tempdir().unwrap();
        let (tx, rx) = unbounded();
        let _refresher = Refresher::start(
            Mode::Catalog { board: "g".into() },
            Deps {
                catalogs: cached_mock(&dir),
                threads: Arc::new(ScriptedThreads),
            },
            Duration::from_millis(10),
            7,
            tx,
        );

        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            Event::Catalog {
                generation,
                board,
                result,
            } => {
                assert_eq!(generation, 7);
                assert_eq!(board, "g");
                assert_eq!(result.unwrap().len(), 2);
            }
            Event::Watched { .. } => panic!("unexpected watched event"),
        }
    }

    #[test]
    fn watched_mode_counts_posts_past_watermark() {
        let dir = tempdir().unwrap();
        let (tx, rx) = unbounded();
        let _refresher = Refresher::start(
            Mode::Watched {
                targets: vec![
                    WatchTarget {
                        board: "g".into(),
                        no: 100,
                        watermark: 1500,
                    },
                    WatchTarget {
                        board: "g".into(),
                        no: 200,
                        watermark: 2000,
                    },
                    WatchTarget {
                        board: "bad".into(),
                        no: 300,
                        watermark: 0,
                    },
                ],
            },
            Deps {
                catalogs: cached_mock(&dir),
                threads: Arc::new(ScriptedThreads),
            },
            Duration::from_millis(10),
            1,
            tx,
        );

        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            Event::Watched {
                updates, failures, ..
            } => {
                assert_eq!(updates.len(), 1);
                assert_eq!(updates[0].no, 100);
                assert_eq!(updates[0].new_posts, 1);
                assert_eq!(updates[0].newest_time, 2000);
                assert_eq!(failures, 1);
            }
            Event::Catalog { .. } => panic!("unexpected catalog event"),
        }
    }
}
