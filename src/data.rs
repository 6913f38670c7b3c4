use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::chan::{self, Board, Post, PostId, Thread};
use crate::comment::{self, CommentBody};
use crate::storage::Store;

pub trait BoardService: Send + Sync {
    fn list_boards(&self) -> Result<Vec<Board>>;
}

pub trait CatalogService: Send + Sync {
    fn load_catalog(&self, board: &str) -> Result<Vec<Post>>;
}

pub trait ThreadService: Send + Sync {
    fn load_thread(&self, board: &str, no: PostId) -> Result<Thread>;
}

pub struct ChanBoardService {
    client: Arc<chan::Client>,
}

impl ChanBoardService {
    pub fn new(client: Arc<chan::Client>) -> Self {
        Self { client }
    }
}

impl BoardService for ChanBoardService {
    fn list_boards(&self) -> Result<Vec<Board>> {
        self.client.boards().context("fetch board list")
    }
}

pub struct ChanCatalogService {
    client: Arc<chan::Client>,
}

impl ChanCatalogService {
    pub fn new(client: Arc<chan::Client>) -> Self {
        Self { client }
    }
}

impl CatalogService for ChanCatalogService {
    fn load_catalog(&self, board: &str) -> Result<Vec<Post>> {
        let pages = self
            .client
            .catalog(board)
            .with_context(|| format!("fetch catalog /{board}/"))?;
        Ok(crate::catalog::flatten_pages(&pages))
    }
}

pub struct ChanThreadService {
    client: Arc<chan::Client>,
}

impl ChanThreadService {
    pub fn new(client: Arc<chan::Client>) -> Self {
        Self { client }
    }
}

impl ThreadService for ChanThreadService {
    fn load_thread(&self, board: &str, no: PostId) -> Result<Thread> {
        self.client
            .thread(board, no)
            .with_context(|| format!("fetch thread /{board}/{no}"))
    }
}

/// Serves a board's catalog from the kv cache while the envelope is fresh.
/// Cache trouble never fails a load; it just falls through to the network.
pub struct CachedCatalogService {
    inner: Arc<dyn CatalogService>,
    store: Store,
    ttl: Duration,
}

impl CachedCatalogService {
    pub fn new(inner: Arc<dyn CatalogService>, store: Store, ttl: Duration) -> Self {
        Self { inner, store, ttl }
    }

    /// Bypass the cache (explicit refresh), rewriting it on success.
    pub fn load_fresh(&self, board: &str) -> Result<Vec<Post>> {
        let posts = self.inner.load_catalog(board)?;
        let _ = self.store.put_cache(&catalog_resource(board), &posts);
        Ok(posts)
    }
}

impl CatalogService for CachedCatalogService {
    fn load_catalog(&self, board: &str) -> Result<Vec<Post>> {
        if let Ok(Some(posts)) = self
            .store
            .get_cache::<Vec<Post>>(&catalog_resource(board), self.ttl)
        {
            return Ok(posts);
        }
        self.load_fresh(board)
    }
}

fn catalog_resource(board: &str) -> String {
    format!("catalog:{board}")
}

/// A thread post with its body parsed once.
pub struct ThreadPost {
    pub post: Post,
    pub body: CommentBody,
}

/// Flat thread with position and reply indexes. Posts stay in time order;
/// reply markers resolve through the index and may dangle (deleted posts).
pub struct ThreadView {
    pub board: String,
    pub no: PostId,
    pub posts: Vec<ThreadPost>,
    positions: HashMap<PostId, usize>,
    replies: HashMap<PostId, Vec<PostId>>,
}

impl ThreadView {
    pub fn build(board: &str, no: PostId, thread: Thread) -> Self {
        let posts: Vec<ThreadPost> = thread
            .posts
            .into_iter()
            .map(|post| {
                let body = comment::parse_body(post.body());
                ThreadPost { post, body }
            })
            .collect();

        let mut positions = HashMap::with_capacity(posts.len());
        for (idx, entry) in posts.iter().enumerate() {
            positions.insert(entry.post.no, idx);
        }

        let mut replies: HashMap<PostId, Vec<PostId>> = HashMap::new();
        for entry in &posts {
            let mut seen = HashSet::new();
            for target in entry.body.reply_targets() {
                if seen.insert(target) {
                    replies.entry(target).or_default().push(entry.post.no);
                }
            }
        }

        Self {
            board: board.to_string(),
            no,
            posts,
            positions,
            replies,
        }
    }

    pub fn position(&self, no: PostId) -> Option<usize> {
        self.positions.get(&no).copied()
    }

    pub fn post(&self, no: PostId) -> Option<&ThreadPost> {
        self.position(no).map(|idx| &self.posts[idx])
    }

    pub fn op(&self) -> Option<&ThreadPost> {
        self.posts.first()
    }

    pub fn replies_to(&self, no: PostId) -> &[PostId] {
        self.replies.get(&no).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn newest_time(&self) -> i64 {
        self.posts
            .iter()
            .map(|entry| entry.post.time)
            .max()
            .unwrap_or(0)
    }
}

#[derive(Default)]
pub struct MockBoardService;

impl BoardService for MockBoardService {
    fn list_boards(&self) -> Result<Vec<Board>> {
        Ok(vec![
            Board {
                board: "g".into(),
                title: "Technology".into(),
                meta_description: "Sample board provided for offline browsing.".into(),
            },
            Board {
                board: "wg".into(),
                title: "Wallpapers/General".into(),
                meta_description: "Sample board provided for offline browsing.".into(),
            },
        ])
    }
}

#[derive(Default)]
pub struct MockCatalogService;

impl CatalogService for MockCatalogService {
    fn load_catalog(&self, board: &str) -> Result<Vec<Post>> {
        Ok(vec![
            Post {
                no: 1000,
                sub: Some(format!("Welcome to /{board}/")),
                com: Some("Sample catalog provided for offline browsing.".into()),
                time: 1714000000,
                replies: 2,
                last_modified: 1714000200,
                ..Post::default()
            },
            Post {
                no: 2000,
                com: Some("A second sample thread.<br>&gt;with greentext".into()),
                time: 1714000100,
                replies: 0,
                last_modified: 1714000100,
                ..Post::default()
            },
        ])
    }
}

#[derive(Default)]
pub struct MockThreadService;

impl ThreadService for MockThreadService {
    fn load_thread(&self, _board: &str, no: PostId) -> Result<Thread> {
        Ok(Thread {
            posts: vec![
                Post {
                    no,
                    sub: Some("Sample thread".into()),
                    com: Some("Opening post for offline browsing.".into()),
                    time: 1714000000,
                    replies: 2,
                    ..Post::default()
                },
                Post {
                    no: no + 1,
                    com: Some(format!("&gt;&gt;{no}<br>First sample reply.")),
                    time: 1714000060,
                    ..Post::default()
                },
                Post {
                    no: no + 2,
                    com: Some("&gt;sample greentext<br>Second sample reply.".into()),
                    time: 1714000120,
                    ..Post::default()
                },
            ],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Options;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct CountingCatalog {
        hits: AtomicUsize,
    }

    impl CatalogService for CountingCatalog {
        fn load_catalog(&self, _board: &str) -> Result<Vec<Post>> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Post {
                no: 1,
                com: Some("hi".into()),
                ..Post::default()
            }])
        }
    }

    #[test]
    fn cached_catalog_serves_fresh_entries_without_refetch() {
        let dir = tempdir().unwrap();
        let store = Store::open(Options {
            path: Some(dir.path().join("state.db")),
        })
        .unwrap();
        let counting = Arc::new(CountingCatalog {
            hits: AtomicUsize::new(0),
        });
        let cached =
            CachedCatalogService::new(counting.clone(), store, Duration::from_secs(3600));

        let first = cached.load_catalog("g").unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(counting.hits.load(Ordering::SeqCst), 1);

        let second = cached.load_catalog("g").unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(counting.hits.load(Ordering::SeqCst), 1);

        cached.load_fresh("g").unwrap();
        assert_eq!(counting.hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn mock_services_cover_the_offline_path() {
        let boards = MockBoardService.list_boards().unwrap();
        assert!(boards.iter().any(|b| b.board == "g"));

        let posts = MockCatalogService.load_catalog("g").unwrap();
        assert_eq!(posts[0].subject(), Some("Welcome to /g/"));
        assert!(posts[1].subject().is_none());
    }

    #[test]
    fn thread_view_indexes_positions_and_replies() {
        let thread = MockThreadService.load_thread("g", 500).unwrap();
        let view = ThreadView::build("g", 500, thread);

        assert_eq!(view.posts.len(), 3);
        assert_eq!(view.position(500), Some(0));
        assert_eq!(view.position(501), Some(1));
        assert_eq!(view.position(9999), None);
        assert_eq!(view.replies_to(500), &[501]);
        assert!(view.replies_to(501).is_empty());
        assert_eq!(view.newest_time(), 1714000120);
        assert!(view.op().unwrap().post.sub.is_some());
    }

    #[test]
    fn thread_view_dedupes_repeat_markers_and_keeps_danglers() {
        let thread = Thread {
            posts: vec![
                Post {
                    no: 10,
                    com: Some("op".into()),
                    ..Post::default()
                },
                Post {
                    no: 11,
                    com: Some("&gt;&gt;10 and &gt;&gt;10 again, also &gt;&gt;404".into()),
                    ..Post::default()
                },
            ],
        };
        let view = ThreadView::build("g", 10, thread);
        assert_eq!(view.replies_to(10), &[11]);
        // dangling target indexed but unresolvable
        assert_eq!(view.replies_to(404), &[11]);
        assert_eq!(view.position(404), None);
        assert_eq!(view.posts[1].body.reply_targets(), vec![10, 10, 404]);
    }
}
