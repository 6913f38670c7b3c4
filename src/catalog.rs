use std::cmp::Reverse;
use std::collections::HashSet;

use crate::chan::{CatalogPage, ImageRef, Post, PostId};
use crate::comment;
use crate::settings::Settings;

pub const CATALOG_PREVIEW_CHARS: usize = 50;

const IMAGE_EXTS: [&str; 3] = [".jpg", ".png", ".gif"];
const VIDEO_EXTS: [&str; 2] = [".webm", ".mp4"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MediaFilter {
    #[default]
    All,
    Images,
    Videos,
}

impl MediaFilter {
    pub fn cycle(self) -> Self {
        match self {
            MediaFilter::All => MediaFilter::Images,
            MediaFilter::Images => MediaFilter::Videos,
            MediaFilter::Videos => MediaFilter::All,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            MediaFilter::All => "all",
            MediaFilter::Images => "images",
            MediaFilter::Videos => "videos",
        }
    }

    pub fn admits(self, post: &Post) -> bool {
        match self {
            MediaFilter::All => true,
            MediaFilter::Images => has_ext(post, &IMAGE_EXTS),
            MediaFilter::Videos => has_ext(post, &VIDEO_EXTS),
        }
    }
}

fn has_ext(post: &Post, allowed: &[&str]) -> bool {
    match post.ext.as_deref() {
        Some(ext) => allowed.iter().any(|want| ext.eq_ignore_ascii_case(want)),
        None => false,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    /// Bump order as the API returns it, page by page.
    #[default]
    Default,
    Replies,
    LastModified,
}

impl SortOrder {
    pub fn cycle(self) -> Self {
        match self {
            SortOrder::Default => SortOrder::Replies,
            SortOrder::Replies => SortOrder::LastModified,
            SortOrder::LastModified => SortOrder::Default,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SortOrder::Default => "bump order",
            SortOrder::Replies => "replies",
            SortOrder::LastModified => "last modified",
        }
    }
}

/// Collapse catalog pages into one list, preserving page order.
pub fn flatten_pages(pages: &[CatalogPage]) -> Vec<Post> {
    pages
        .iter()
        .flat_map(|page| page.threads.iter().cloned())
        .collect()
}

/// Case-insensitive substring match against subject and comment text.
pub fn matches_query(post: &Post, query: &str) -> bool {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return true;
    }
    if let Some(sub) = post.subject() {
        if comment::sanitize(sub).to_lowercase().contains(&needle) {
            return true;
        }
    }
    comment::sanitize(post.body())
        .to_lowercase()
        .contains(&needle)
}

pub fn filter_posts(posts: &[Post], query: &str, media: MediaFilter) -> Vec<Post> {
    posts
        .iter()
        .filter(|post| media.admits(post) && matches_query(post, query))
        .cloned()
        .collect()
}

/// Stable descending sort; `Default` leaves the API order untouched.
pub fn sort_posts(posts: &mut [Post], order: SortOrder) {
    match order {
        SortOrder::Default => {}
        SortOrder::Replies => posts.sort_by_key(|post| Reverse(post.replies)),
        SortOrder::LastModified => posts.sort_by_key(|post| Reverse(post.last_modified)),
    }
}

/// Move pinned threads to the front, keeping relative order on both sides.
pub fn pin_front(posts: Vec<Post>, pinned: &HashSet<PostId>) -> Vec<Post> {
    if pinned.is_empty() {
        return posts;
    }
    let (mut front, rest): (Vec<Post>, Vec<Post>) =
        posts.into_iter().partition(|post| pinned.contains(&post.no));
    front.extend(rest);
    front
}

/// Full catalog pipeline: filter, then sort, then float pins.
pub fn build(
    posts: &[Post],
    query: &str,
    media: MediaFilter,
    order: SortOrder,
    pinned: &HashSet<PostId>,
) -> Vec<Post> {
    let mut shown = filter_posts(posts, query, media);
    sort_posts(&mut shown, order);
    pin_front(shown, pinned)
}

/// What the catalog pane renders per thread.
pub struct CatalogEntry {
    pub no: PostId,
    pub title: String,
    pub author: String,
    pub preview: String,
    pub replies: i64,
    pub images: i64,
    pub pinned: bool,
    pub watched: bool,
    pub tags: Vec<String>,
    pub image: Option<ImageRef>,
    pub time: i64,
}

pub fn to_entries(posts: Vec<Post>, board: &str, settings: &Settings) -> Vec<CatalogEntry> {
    posts
        .into_iter()
        .map(|post| {
            let title = match post.subject() {
                Some(sub) => comment::sanitize(sub),
                None => format!("Thread #{}", post.no),
            };
            let preview = comment::parse_body(post.body()).preview(CATALOG_PREVIEW_CHARS);
            CatalogEntry {
                no: post.no,
                title,
                author: post.author().to_string(),
                preview,
                replies: post.replies,
                images: post.images,
                pinned: settings.is_pinned(board, post.no),
                watched: settings.is_watched(board, post.no),
                tags: settings.tags_for(board, post.no),
                image: post.image(),
                time: post.time,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(no: PostId, sub: &str, com: &str, replies: i64) -> Post {
        Post {
            no,
            sub: (!sub.is_empty()).then(|| sub.to_string()),
            com: (!com.is_empty()).then(|| com.to_string()),
            replies,
            ..Post::default()
        }
    }

    #[test]
    fn query_matches_subject_and_comment_case_insensitive() {
        let p = post(1, "Rust General", "talk about &amp;borrows", 0);
        assert!(matches_query(&p, "rust"));
        assert!(matches_query(&p, "RUST"));
        assert!(matches_query(&p, "&borrows"));
        assert!(!matches_query(&p, "haskell"));
        assert!(matches_query(&p, "  "));
    }

    #[test]
    fn media_filter_uses_allow_lists() {
        let mut p = post(1, "", "x", 0);
        assert!(MediaFilter::All.admits(&p));
        assert!(!MediaFilter::Images.admits(&p));

        p.ext = Some(".JPG".into());
        assert!(MediaFilter::Images.admits(&p));
        assert!(!MediaFilter::Videos.admits(&p));

        p.ext = Some(".webm".into());
        assert!(MediaFilter::Videos.admits(&p));
        assert!(!MediaFilter::Images.admits(&p));

        p.ext = Some(".pdf".into());
        assert!(!MediaFilter::Images.admits(&p));
        assert!(!MediaFilter::Videos.admits(&p));
    }

    #[test]
    fn reply_sort_is_descending_and_stable() {
        let mut posts = vec![
            post(1, "", "a", 3),
            post(2, "", "b", 7),
            post(3, "", "c", 3),
        ];
        sort_posts(&mut posts, SortOrder::Replies);
        let order: Vec<PostId> = posts.iter().map(|p| p.no).collect();
        assert_eq!(order, vec![2, 1, 3]);
    }

    #[test]
    fn pinned_threads_float_in_stable_order() {
        let posts = vec![post(1, "", "a", 1), post(2, "", "b", 9)];
        let mut shown = posts.clone();
        sort_posts(&mut shown, SortOrder::Replies);
        assert_eq!(shown[0].no, 2);

        let pinned: HashSet<PostId> = [1].into_iter().collect();
        let shown = pin_front(shown, &pinned);
        let order: Vec<PostId> = shown.iter().map(|p| p.no).collect();
        assert_eq!(order, vec![1, 2]);
    }

    #[test]
    fn entries_carry_fallbacks_and_annotations() {
        let mut settings = Settings::default();
        settings.toggle_pin("g", 2);
        settings.define_tag("news");
        settings.toggle_tag("g", 2, "news");

        let posts = vec![
            post(1, "Rust &amp; Friends", "hello world", 3),
            post(2, "", "", 0),
        ];
        let entries = to_entries(posts, "g", &settings);

        assert_eq!(entries[0].title, "Rust & Friends");
        assert_eq!(entries[0].preview, "hello world");
        assert_eq!(entries[0].author, "Anonymous");
        assert!(!entries[0].pinned);

        assert_eq!(entries[1].title, "Thread #2");
        assert_eq!(entries[1].preview, comment::PLACEHOLDER);
        assert!(entries[1].pinned);
        assert_eq!(entries[1].tags, vec!["news".to_string()]);
    }

    #[test]
    fn build_composes_filter_sort_pin() {
        let posts = vec![
            post(1, "cats", "meow", 2),
            post(2, "dogs", "woof", 8),
            post(3, "cats", "purr", 5),
            post(4, "cats", "hiss", 9),
        ];
        let pinned: HashSet<PostId> = [3].into_iter().collect();
        let shown = build(&posts, "cats", MediaFilter::All, SortOrder::Replies, &pinned);
        let order: Vec<PostId> = shown.iter().map(|p| p.no).collect();
        assert_eq!(order, vec![3, 4, 1]);
    }
}
