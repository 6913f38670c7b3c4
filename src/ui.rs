use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::io::{self, Stdout, Write};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use arboard::Clipboard;
use chrono::{Local, TimeZone};
use crossbeam_channel::{unbounded, Receiver, Sender};
use crossterm::event::{
    self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind, MouseButton,
    MouseEvent, MouseEventKind,
};
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Clear, List, ListItem, Padding, Paragraph, Wrap};
use ratatui::{Frame, Terminal};
use unicode_width::UnicodeWidthStr;

use crate::catalog::{self, CatalogEntry, MediaFilter, SortOrder};
use crate::chan::{self, Board, ImageRef, Post, PostId};
use crate::comment;
use crate::data::{BoardService, CachedCatalogService, CatalogService, ThreadService, ThreadView};
use crate::geo;
use crate::media;
use crate::settings::{Settings, SettingsStore};
use crate::storage::MediaEntry;
use crate::watch;

const SPINNER_FRAMES: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
const TICK_RATE: Duration = Duration::from_millis(120);
const HIGHLIGHT_TTL: Duration = Duration::from_secs(1);
const REPLY_PREVIEW_CHARS: usize = 47;
const POPUP_MARGIN: u16 = 2;
const BOARD_PAGE_BASE: &str = "https://boards.4chan.org";

struct Theme {
    bg: Color,
    panel_bg: Color,
    panel_focused_bg: Color,
    panel_selected_bg: Color,
    border_idle: Color,
    border_focused: Color,
    text_primary: Color,
    text_secondary: Color,
    accent: Color,
    success: Color,
    error: Color,
}

impl Theme {
    fn default_theme() -> Self {
        Self {
            bg: Color::Rgb(30, 30, 46),
            panel_bg: Color::Rgb(24, 24, 36),
            panel_focused_bg: Color::Rgb(49, 50, 68),
            panel_selected_bg: Color::Rgb(69, 71, 90),
            border_idle: Color::Rgb(49, 50, 68),
            border_focused: Color::Rgb(137, 180, 250),
            text_primary: Color::Rgb(205, 214, 244),
            text_secondary: Color::Rgb(166, 173, 200),
            accent: Color::Rgb(137, 180, 250),
            success: Color::Rgb(166, 227, 161),
            error: Color::Rgb(243, 139, 168),
        }
    }

    fn high_contrast() -> Self {
        Self {
            bg: Color::Black,
            panel_bg: Color::Black,
            panel_focused_bg: Color::DarkGray,
            panel_selected_bg: Color::White,
            border_idle: Color::Gray,
            border_focused: Color::Yellow,
            text_primary: Color::White,
            text_secondary: Color::Gray,
            accent: Color::Yellow,
            success: Color::Green,
            error: Color::Red,
        }
    }

    fn pick(name: &str, high_contrast: bool) -> Self {
        if high_contrast || name == "high-contrast" {
            Self::high_contrast()
        } else {
            Self::default_theme()
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Pane {
    Boards,
    Catalog,
    Thread,
}

impl Pane {
    fn title(self) -> &'static str {
        match self {
            Pane::Boards => " Boards ",
            Pane::Catalog => " Catalog ",
            Pane::Thread => " Thread ",
        }
    }

    fn next(self) -> Pane {
        match self {
            Pane::Boards => Pane::Catalog,
            Pane::Catalog => Pane::Thread,
            Pane::Thread => Pane::Thread,
        }
    }

    fn previous(self) -> Pane {
        match self {
            Pane::Boards => Pane::Boards,
            Pane::Catalog => Pane::Boards,
            Pane::Thread => Pane::Catalog,
        }
    }
}

struct Spinner {
    index: usize,
    last_tick: Instant,
}

impl Spinner {
    fn new() -> Self {
        Self {
            index: 0,
            last_tick: Instant::now(),
        }
    }

    fn frame(&self) -> &'static str {
        SPINNER_FRAMES[self.index % SPINNER_FRAMES.len()]
    }

    fn advance(&mut self) -> bool {
        if self.last_tick.elapsed() >= TICK_RATE {
            self.index = (self.index + 1) % SPINNER_FRAMES.len();
            self.last_tick = Instant::now();
            return true;
        }
        false
    }

    fn reset(&mut self) {
        self.index = 0;
        self.last_tick = Instant::now();
    }
}

struct PendingBoards {
    request_id: u64,
    cancel_flag: Arc<AtomicBool>,
}

struct PendingCatalog {
    request_id: u64,
    cancel_flag: Arc<AtomicBool>,
    board: String,
}

struct PendingThread {
    request_id: u64,
    cancel_flag: Arc<AtomicBool>,
    board: String,
    no: PostId,
}

enum AsyncResponse {
    Boards {
        request_id: u64,
        result: Result<Vec<Board>>,
    },
    Catalog {
        request_id: u64,
        board: String,
        result: Result<Vec<Post>>,
    },
    Thread {
        request_id: u64,
        board: String,
        no: PostId,
        result: Result<ThreadView>,
    },
    Geo {
        info: geo::GeoInfo,
    },
    Media {
        url: String,
        result: Result<MediaEntry>,
    },
}

/// One row of the boards pane after favorites ordering and search filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BoardRow {
    code: String,
    title: String,
    favorite: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum InputTarget {
    BoardSearch,
    CatalogFilter,
    TagName,
    TagAssign,
}

struct InputState {
    target: InputTarget,
    buffer: String,
}

struct ImageOverlay {
    board: String,
    no: PostId,
    image: ImageRef,
    url: String,
}

struct ReplyPreview {
    target: PostId,
    anchor: (u16, u16),
}

struct ZoomPreview {
    url: String,
    image: ImageRef,
    at: (u16, u16),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SettingsItem {
    AutoRefresh,
    HoverZoom,
    ShowIp,
    HighContrast,
    Tag(usize),
    AddTag,
}

pub struct ModelOptions {
    pub boards: Arc<dyn BoardService>,
    pub catalogs: Arc<CachedCatalogService>,
    pub threads: Arc<dyn ThreadService>,
    pub settings: Arc<dyn SettingsStore>,
    pub media: Option<Arc<media::Manager>>,
    pub client: Arc<chan::Client>,
    pub refresh_period: Duration,
    pub theme: String,
}

pub struct Model {
    boards_service: Arc<dyn BoardService>,
    catalogs: Arc<CachedCatalogService>,
    threads: Arc<dyn ThreadService>,
    settings_store: Arc<dyn SettingsStore>,
    media: Option<Arc<media::Manager>>,
    client: Arc<chan::Client>,
    refresh_period: Duration,
    theme_name: String,

    settings: Settings,
    theme: Theme,

    focused_pane: Pane,
    status_message: String,
    needs_redraw: bool,
    bell_pending: bool,
    spinner: Spinner,

    boards: Vec<Board>,
    board_rows: Vec<BoardRow>,
    selected_board: usize,
    board_query: String,
    boards_error: Option<String>,
    board_offset: Cell<usize>,
    board_rows_visible: Cell<usize>,

    current_board: Option<String>,
    catalog_posts: Vec<Post>,
    catalog_entries: Vec<CatalogEntry>,
    selected_entry: usize,
    catalog_query: String,
    catalog_sort: SortOrder,
    catalog_media: MediaFilter,
    catalog_error: Option<String>,
    catalog_offset: Cell<usize>,
    catalog_rows_visible: Cell<usize>,

    thread: Option<ThreadView>,
    selected_post: usize,
    thread_error: Option<String>,
    thread_offset: Cell<usize>,
    thread_last_visible: Cell<usize>,
    highlight: Option<(PostId, Instant)>,

    media_info: HashMap<String, MediaEntry>,
    media_failures: HashSet<String>,
    pending_media: HashSet<String>,

    geo: Option<geo::GeoInfo>,
    geo_requested: bool,

    input: Option<InputState>,
    settings_visible: bool,
    settings_cursor: usize,
    image_overlay: Option<ImageOverlay>,
    reply_preview: Option<ReplyPreview>,
    zoom_preview: Option<ZoomPreview>,

    pane_areas: Vec<(Pane, Rect)>,
    thread_rows: Vec<(u16, u16, usize)>,
    selected_row_y: Cell<u16>,

    response_tx: Sender<AsyncResponse>,
    response_rx: Receiver<AsyncResponse>,
    watch_tx: Sender<watch::Event>,
    watch_rx: Receiver<watch::Event>,
    next_request_id: u64,
    pending_boards: Option<PendingBoards>,
    pending_catalog: Option<PendingCatalog>,
    pending_thread: Option<PendingThread>,

    refresher: Option<watch::Refresher>,
    refresh_generation: u64,
}

impl Model {
    pub fn new(opts: ModelOptions) -> Model {
        let (response_tx, response_rx) = unbounded();
        let (watch_tx, watch_rx) = unbounded();

        let (settings, settings_note) = match opts.settings.load() {
            Ok(settings) => (settings, None),
            Err(err) => (
                Settings::default(),
                Some(format!("Failed to load settings: {err:#}")),
            ),
        };
        let theme = Theme::pick(&opts.theme, settings.high_contrast);

        let mut model = Model {
            boards_service: opts.boards,
            catalogs: opts.catalogs,
            threads: opts.threads,
            settings_store: opts.settings,
            media: opts.media,
            client: opts.client,
            refresh_period: opts.refresh_period,
            theme_name: opts.theme,

            settings,
            theme,

            focused_pane: Pane::Boards,
            status_message: "Loading boards…".to_string(),
            needs_redraw: true,
            bell_pending: false,
            spinner: Spinner::new(),

            boards: Vec::new(),
            board_rows: Vec::new(),
            selected_board: 0,
            board_query: String::new(),
            boards_error: None,
            board_offset: Cell::new(0),
            board_rows_visible: Cell::new(1),

            current_board: None,
            catalog_posts: Vec::new(),
            catalog_entries: Vec::new(),
            selected_entry: 0,
            catalog_query: String::new(),
            catalog_sort: SortOrder::Default,
            catalog_media: MediaFilter::All,
            catalog_error: None,
            catalog_offset: Cell::new(0),
            catalog_rows_visible: Cell::new(1),

            thread: None,
            selected_post: 0,
            thread_error: None,
            thread_offset: Cell::new(0),
            thread_last_visible: Cell::new(0),
            highlight: None,

            media_info: HashMap::new(),
            media_failures: HashSet::new(),
            pending_media: HashSet::new(),

            geo: None,
            geo_requested: false,

            input: None,
            settings_visible: false,
            settings_cursor: 0,
            image_overlay: None,
            reply_preview: None,
            zoom_preview: None,

            pane_areas: Vec::new(),
            thread_rows: Vec::new(),
            selected_row_y: Cell::new(0),

            response_tx,
            response_rx,
            watch_tx,
            watch_rx,
            next_request_id: 0,
            pending_boards: None,
            pending_catalog: None,
            pending_thread: None,

            refresher: None,
            refresh_generation: 0,
        };

        if let Some(note) = settings_note {
            model.status_message = note;
        }
        model.reload_boards();
        if model.settings.show_ip {
            model.queue_geo_lookup();
        }
        model.sync_refresher();
        model
    }

    pub fn run(&mut self) -> Result<()> {
        let mut stdout = io::stdout();
        enable_raw_mode()?;
        stdout.execute(EnterAlternateScreen)?;
        stdout.execute(EnableMouseCapture)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;
        terminal.clear()?;

        let result = self.event_loop(&mut terminal);

        disable_raw_mode()?;
        terminal.backend_mut().execute(DisableMouseCapture)?;
        terminal.backend_mut().execute(LeaveAlternateScreen)?;
        terminal.show_cursor()?;

        result
    }

    fn event_loop(&mut self, terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
        let mut last_tick = Instant::now();

        loop {
            if self.poll_async() {
                self.mark_dirty();
            }
            if self.poll_watch() {
                self.mark_dirty();
            }

            if self.needs_redraw {
                terminal.draw(|frame| self.draw(frame))?;
                self.needs_redraw = false;
                if self.bell_pending {
                    self.bell_pending = false;
                    let mut out = io::stdout();
                    out.write_all(b"\x07")?;
                    out.flush()?;
                }
            }

            let timeout = TICK_RATE
                .checked_sub(last_tick.elapsed())
                .unwrap_or_else(|| Duration::from_millis(16));

            if event::poll(timeout)? {
                match event::read()? {
                    Event::Key(key) if key.kind == KeyEventKind::Press => {
                        match self.handle_key(key.code) {
                            Ok(true) => break,
                            Ok(false) => {}
                            Err(err) => {
                                self.status_message = format!("Error: {err:#}");
                                self.mark_dirty();
                            }
                        }
                    }
                    Event::Mouse(mouse) => {
                        if let Err(err) = self.handle_mouse(mouse) {
                            self.status_message = format!("Error: {err:#}");
                            self.mark_dirty();
                        }
                    }
                    Event::Resize(_, _) => self.mark_dirty(),
                    _ => {}
                }
            }

            if self.poll_async() {
                self.mark_dirty();
            }

            if last_tick.elapsed() >= TICK_RATE {
                last_tick = Instant::now();
                if self.is_loading() {
                    if self.spinner.advance() {
                        self.mark_dirty();
                    }
                } else {
                    self.spinner.reset();
                }
                if let Some((_, since)) = self.highlight {
                    if since.elapsed() >= HIGHLIGHT_TTL {
                        self.highlight = None;
                        self.mark_dirty();
                    }
                }
            }
        }

        Ok(())
    }

    fn mark_dirty(&mut self) {
        self.needs_redraw = true;
    }

    fn is_loading(&self) -> bool {
        self.pending_boards.is_some()
            || self.pending_catalog.is_some()
            || self.pending_thread.is_some()
            || !self.pending_media.is_empty()
    }

    fn next_request(&mut self) -> (u64, Arc<AtomicBool>) {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        (id, Arc::new(AtomicBool::new(false)))
    }

    // ---- async loads ----

    fn reload_boards(&mut self) {
        if let Some(pending) = self.pending_boards.take() {
            pending.cancel_flag.store(true, Ordering::SeqCst);
        }
        let (request_id, cancel_flag) = self.next_request();
        self.pending_boards = Some(PendingBoards {
            request_id,
            cancel_flag: cancel_flag.clone(),
        });
        self.boards_error = None;
        self.status_message = "Loading boards…".to_string();
        self.spinner.reset();

        let service = self.boards_service.clone();
        let tx = self.response_tx.clone();
        thread::spawn(move || {
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let result = service.list_boards();
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let _ = tx.send(AsyncResponse::Boards { request_id, result });
        });
    }

    fn reload_catalog(&mut self, force: bool) {
        let Some(board) = self.current_board.clone() else {
            self.status_message = "Select a board first.".to_string();
            return;
        };
        if let Some(pending) = self.pending_catalog.take() {
            pending.cancel_flag.store(true, Ordering::SeqCst);
        }
        let (request_id, cancel_flag) = self.next_request();
        self.pending_catalog = Some(PendingCatalog {
            request_id,
            cancel_flag: cancel_flag.clone(),
            board: board.clone(),
        });
        self.catalog_error = None;
        self.status_message = format!("Loading /{board}/…");
        self.spinner.reset();

        let service = self.catalogs.clone();
        let tx = self.response_tx.clone();
        thread::spawn(move || {
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let result = if force {
                service.load_fresh(&board)
            } else {
                service.load_catalog(&board)
            };
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let _ = tx.send(AsyncResponse::Catalog {
                request_id,
                board,
                result,
            });
        });
    }

    fn reload_thread(&mut self, board: String, no: PostId) {
        if let Some(pending) = self.pending_thread.take() {
            pending.cancel_flag.store(true, Ordering::SeqCst);
        }
        let (request_id, cancel_flag) = self.next_request();
        self.pending_thread = Some(PendingThread {
            request_id,
            cancel_flag: cancel_flag.clone(),
            board: board.clone(),
            no,
        });
        self.thread_error = None;
        self.status_message = format!("Loading /{board}/ thread #{no}…");
        self.spinner.reset();

        let service = self.threads.clone();
        let tx = self.response_tx.clone();
        thread::spawn(move || {
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let result = service
                .load_thread(&board, no)
                .map(|thread| ThreadView::build(&board, no, thread));
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let _ = tx.send(AsyncResponse::Thread {
                request_id,
                board,
                no,
                result,
            });
        });
    }

    fn queue_geo_lookup(&mut self) {
        if self.geo_requested {
            return;
        }
        self.geo_requested = true;
        let tx = self.response_tx.clone();
        thread::spawn(move || {
            // best effort; failures show the masked placeholder
            let info = geo::lookup().unwrap_or_else(|_| geo::placeholder());
            let _ = tx.send(AsyncResponse::Geo { info });
        });
    }

    fn request_media(&mut self, url: String, image: &ImageRef) {
        let Some(manager) = &self.media else {
            return;
        };
        if self.media_info.contains_key(&url)
            || self.media_failures.contains(&url)
            || self.pending_media.contains(&url)
        {
            return;
        }
        self.pending_media.insert(url.clone());
        let rx = manager.enqueue(media::Request {
            url: url.clone(),
            media_type: None,
            width: (image.width > 0).then_some(image.width),
            height: (image.height > 0).then_some(image.height),
            ttl: None,
            force: false,
        });
        let tx = self.response_tx.clone();
        thread::spawn(move || {
            let result = match rx.recv() {
                Ok(outcome) => match (outcome.entry, outcome.error) {
                    (Some(entry), _) => Ok(entry),
                    (None, Some(err)) => Err(err),
                    (None, None) => Err(anyhow!("media fetch produced nothing")),
                },
                Err(_) => Err(anyhow!("media worker dropped the request")),
            };
            let _ = tx.send(AsyncResponse::Media { url, result });
        });
    }

    fn ensure_media_for_selection(&mut self) {
        let Some(view) = &self.thread else {
            return;
        };
        let Some(entry) = view.posts.get(self.selected_post) else {
            return;
        };
        if let Some(image) = entry.post.image() {
            let url = self.client.thumb_url(&view.board, &image);
            self.request_media(url, &image);
        }
    }

    // ---- async responses ----

    fn poll_async(&mut self) -> bool {
        let mut changed = false;
        while let Ok(message) = self.response_rx.try_recv() {
            self.handle_async_response(message);
            changed = true;
        }
        changed
    }

    fn handle_async_response(&mut self, message: AsyncResponse) {
        match message {
            AsyncResponse::Boards { request_id, result } => {
                let Some(pending) = &self.pending_boards else {
                    return;
                };
                if pending.cancel_flag.load(Ordering::SeqCst) || pending.request_id != request_id {
                    return;
                }
                self.pending_boards = None;

                match result {
                    Ok(boards) => {
                        self.boards = boards;
                        self.boards_error = None;
                        self.rebuild_board_rows();
                        self.status_message = format!("{} boards loaded.", self.boards.len());
                    }
                    Err(err) => {
                        self.boards_error = Some(format!("{err:#}"));
                        self.status_message = "Failed to load boards.".to_string();
                    }
                }
                self.mark_dirty();
            }
            AsyncResponse::Catalog {
                request_id,
                board,
                result,
            } => {
                let Some(pending) = &self.pending_catalog else {
                    return;
                };
                if pending.cancel_flag.load(Ordering::SeqCst)
                    || pending.request_id != request_id
                    || pending.board != board
                {
                    return;
                }
                if self.current_board.as_deref() != Some(board.as_str()) {
                    return;
                }
                self.pending_catalog = None;

                match result {
                    Ok(posts) => {
                        self.catalog_posts = posts;
                        self.catalog_error = None;
                        self.rebuild_catalog();
                        self.status_message = format!(
                            "/{board}/: {} threads.",
                            self.catalog_entries.len()
                        );
                    }
                    Err(err) => {
                        self.catalog_error = Some(format!("{err:#}"));
                        self.status_message = format!("Failed to load /{board}/.");
                    }
                }
                self.mark_dirty();
            }
            AsyncResponse::Thread {
                request_id,
                board,
                no,
                result,
            } => {
                let Some(pending) = &self.pending_thread else {
                    return;
                };
                if pending.cancel_flag.load(Ordering::SeqCst)
                    || pending.request_id != request_id
                    || pending.board != board
                    || pending.no != no
                {
                    return;
                }
                self.pending_thread = None;

                match result {
                    Ok(view) => {
                        self.thread_error = None;
                        self.selected_post = 0;
                        self.thread_offset.set(0);
                        self.reply_preview = None;
                        self.zoom_preview = None;
                        self.status_message =
                            format!("/{board}/ #{no}: {} posts.", view.posts.len());
                        self.thread = Some(view);
                        self.note_thread_seen();
                        self.ensure_media_for_selection();
                    }
                    Err(err) => {
                        self.thread_error = Some(format!("{err:#}"));
                        self.status_message = format!("Failed to load thread #{no}.");
                    }
                }
                self.mark_dirty();
            }
            AsyncResponse::Geo { info } => {
                self.geo = Some(info);
                self.mark_dirty();
            }
            AsyncResponse::Media { url, result } => {
                self.pending_media.remove(&url);
                match result {
                    Ok(entry) => {
                        self.media_failures.remove(&url);
                        self.media_info.insert(url, entry);
                    }
                    Err(_) => {
                        self.media_info.remove(&url);
                        self.media_failures.insert(url);
                    }
                }
                self.mark_dirty();
            }
        }
    }

    fn poll_watch(&mut self) -> bool {
        let mut changed = false;
        while let Ok(event) = self.watch_rx.try_recv() {
            self.handle_watch_event(event);
            changed = true;
        }
        changed
    }

    fn handle_watch_event(&mut self, event: watch::Event) {
        let live = self
            .refresher
            .as_ref()
            .map(watch::Refresher::generation);
        match event {
            watch::Event::Catalog {
                generation,
                board,
                result,
            } => {
                if live != Some(generation) {
                    return;
                }
                if self.current_board.as_deref() != Some(board.as_str()) {
                    return;
                }
                // a manual reload in flight wins over the background tick
                if self.pending_catalog.is_some() {
                    return;
                }
                match result {
                    Ok(posts) => {
                        self.catalog_posts = posts;
                        self.catalog_error = None;
                        self.rebuild_catalog();
                        self.status_message = format!("/{board}/ refreshed.");
                    }
                    Err(err) => {
                        self.status_message = format!("Auto-refresh failed: {err:#}");
                    }
                }
            }
            watch::Event::Watched {
                generation,
                updates,
                failures,
            } => {
                if live != Some(generation) {
                    return;
                }
                if !updates.is_empty() {
                    let first = &updates[0];
                    let mut message = format!(
                        "{} new post{} in /{}/ #{}",
                        first.new_posts,
                        if first.new_posts == 1 { "" } else { "s" },
                        first.board,
                        first.no
                    );
                    if updates.len() > 1 {
                        message.push_str(&format!(" (+{} more threads)", updates.len() - 1));
                    }
                    self.status_message = message;
                    self.bell_pending = true;
                } else if failures > 0 {
                    self.status_message =
                        format!("Watcher: {failures} thread check(s) failed.");
                }
            }
        }
        self.mark_dirty();
    }

    // ---- background refresh ----

    fn sync_refresher(&mut self) {
        self.refresher = None;
        if !self.settings.auto_refresh {
            return;
        }

        let mode = if self.focused_pane == Pane::Catalog {
            self.current_board
                .clone()
                .map(|board| watch::Mode::Catalog { board })
        } else {
            let targets = self.watch_targets();
            (!targets.is_empty()).then_some(watch::Mode::Watched { targets })
        };
        let Some(mode) = mode else {
            return;
        };

        self.refresh_generation = self.refresh_generation.wrapping_add(1);
        let deps = watch::Deps {
            catalogs: self.catalogs.clone(),
            threads: self.threads.clone(),
        };
        self.refresher = Some(watch::Refresher::start(
            mode,
            deps,
            self.refresh_period,
            self.refresh_generation,
            self.watch_tx.clone(),
        ));
    }

    fn watch_targets(&self) -> Vec<watch::WatchTarget> {
        let mut targets: Vec<watch::WatchTarget> = self
            .settings
            .watched_threads
            .iter()
            .filter_map(|(key, watermark)| {
                let (board, no) = key.split_once(':')?;
                Some(watch::WatchTarget {
                    board: board.to_string(),
                    no: no.parse().ok()?,
                    watermark: *watermark,
                })
            })
            .collect();
        targets.sort_by_key(|target| (target.board.clone(), target.no));
        targets
    }

    fn note_thread_seen(&mut self) {
        let Some(view) = &self.thread else {
            return;
        };
        if !self.settings.is_watched(&view.board, view.no) {
            return;
        }
        let newest = view.newest_time();
        let board = view.board.clone();
        let no = view.no;
        self.settings.set_watermark(&board, no, newest);
        self.persist_settings();
        self.sync_refresher();
    }

    // ---- settings ----

    fn persist_settings(&mut self) {
        if let Err(err) = self.settings_store.save(&self.settings) {
            self.status_message = format!("Failed to save settings: {err:#}");
        }
    }

    fn refresh_theme(&mut self) {
        self.theme = Theme::pick(&self.theme_name, self.settings.high_contrast);
    }

    fn settings_items(&self) -> Vec<SettingsItem> {
        let mut items = vec![
            SettingsItem::AutoRefresh,
            SettingsItem::HoverZoom,
            SettingsItem::ShowIp,
            SettingsItem::HighContrast,
        ];
        for idx in 0..self.settings.thread_tags.len() {
            items.push(SettingsItem::Tag(idx));
        }
        items.push(SettingsItem::AddTag);
        items
    }

    fn toggle_settings_item(&mut self) {
        let items = self.settings_items();
        let Some(item) = items.get(self.settings_cursor).copied() else {
            return;
        };
        match item {
            SettingsItem::AutoRefresh => {
                self.settings.auto_refresh = !self.settings.auto_refresh;
                self.persist_settings();
                self.sync_refresher();
            }
            SettingsItem::HoverZoom => {
                self.settings.hover_zoom = !self.settings.hover_zoom;
                if !self.settings.hover_zoom {
                    self.zoom_preview = None;
                }
                self.persist_settings();
            }
            SettingsItem::ShowIp => {
                self.settings.show_ip = !self.settings.show_ip;
                if self.settings.show_ip && self.geo.is_none() {
                    self.queue_geo_lookup();
                }
                self.persist_settings();
            }
            SettingsItem::HighContrast => {
                self.settings.high_contrast = !self.settings.high_contrast;
                self.refresh_theme();
                self.persist_settings();
            }
            SettingsItem::Tag(_) => {}
            SettingsItem::AddTag => {
                self.input = Some(InputState {
                    target: InputTarget::TagName,
                    buffer: String::new(),
                });
            }
        }
    }

    fn delete_settings_tag(&mut self) {
        let items = self.settings_items();
        let Some(SettingsItem::Tag(idx)) = items.get(self.settings_cursor).copied() else {
            return;
        };
        let Some(name) = self.settings.thread_tags.get(idx).cloned() else {
            return;
        };
        self.settings.delete_tag(&name);
        self.persist_settings();
        self.settings_cursor = self
            .settings_cursor
            .min(self.settings_items().len().saturating_sub(1));
        self.rebuild_catalog();
        self.status_message = format!("Tag \"{name}\" deleted.");
    }

    // ---- boards pane ----

    fn rebuild_board_rows(&mut self) {
        let previous = self
            .board_rows
            .get(self.selected_board)
            .map(|row| row.code.clone());
        self.board_rows = filter_boards(
            &self.boards,
            &self.settings.favorite_boards,
            &self.board_query,
        );
        self.selected_board = previous
            .and_then(|code| self.board_rows.iter().position(|row| row.code == code))
            .unwrap_or(0);
        self.board_offset.set(0);
    }

    fn commit_board_selection(&mut self) {
        let Some(row) = self.board_rows.get(self.selected_board) else {
            self.status_message = "No board selected.".to_string();
            return;
        };
        let code = row.code.clone();
        self.open_board(code);
    }

    fn open_board(&mut self, board: String) {
        self.current_board = Some(board.clone());
        self.catalog_posts.clear();
        self.catalog_entries.clear();
        self.selected_entry = 0;
        self.catalog_offset.set(0);
        self.catalog_query.clear();
        self.thread = None;
        self.thread_error = None;
        self.focused_pane = Pane::Catalog;
        self.reload_catalog(false);
        self.sync_refresher();
    }

    // ---- catalog pane ----

    fn rebuild_catalog(&mut self) {
        let Some(board) = self.current_board.clone() else {
            self.catalog_entries.clear();
            return;
        };
        let previous = self
            .catalog_entries
            .get(self.selected_entry)
            .map(|entry| entry.no);
        let pinned = self.settings.pinned_on(&board);
        let shown = catalog::build(
            &self.catalog_posts,
            &self.catalog_query,
            self.catalog_media,
            self.catalog_sort,
            &pinned,
        );
        self.catalog_entries = catalog::to_entries(shown, &board, &self.settings);
        self.selected_entry = retained_selection(&self.catalog_entries, previous);
        let visible = self.catalog_rows_visible.get().max(1);
        self.catalog_offset
            .set(scrolled_offset(self.selected_entry, self.catalog_offset.get(), visible));
    }

    fn open_selected_thread(&mut self) {
        let Some(board) = self.current_board.clone() else {
            return;
        };
        let Some(entry) = self.catalog_entries.get(self.selected_entry) else {
            self.status_message = "No thread selected.".to_string();
            return;
        };
        let no = entry.no;
        self.focused_pane = Pane::Thread;
        self.reload_thread(board, no);
        self.sync_refresher();
    }

    fn toggle_pin_selected(&mut self) {
        let Some(board) = self.current_board.clone() else {
            return;
        };
        let Some(entry) = self.catalog_entries.get(self.selected_entry) else {
            return;
        };
        let no = entry.no;
        let pinned = self.settings.toggle_pin(&board, no);
        self.persist_settings();
        self.rebuild_catalog();
        self.status_message = if pinned {
            format!("Thread #{no} pinned.")
        } else {
            format!("Thread #{no} unpinned.")
        };
    }

    fn toggle_watch_selected(&mut self) {
        let Some(board) = self.current_board.clone() else {
            return;
        };
        let Some(entry) = self.catalog_entries.get(self.selected_entry) else {
            return;
        };
        let no = entry.no;
        // last_modified tracks the newest reply; the catalog card itself only
        // carries the thread's creation time
        let newest = self
            .catalog_posts
            .iter()
            .find(|post| post.no == no)
            .map(|post| post.last_modified.max(post.time))
            .unwrap_or(entry.time);
        let watched = self.settings.toggle_watch(&board, no, newest);
        self.persist_settings();
        self.rebuild_catalog();
        self.sync_refresher();
        self.status_message = if watched {
            format!("Watching thread #{no}.")
        } else {
            format!("Stopped watching thread #{no}.")
        };
    }

    fn assign_tag(&mut self, name: &str) {
        let Some(board) = self.current_board.clone() else {
            return;
        };
        let Some(entry) = self.catalog_entries.get(self.selected_entry) else {
            return;
        };
        let no = entry.no;
        let name = name.trim();
        if name.is_empty() {
            return;
        }
        self.settings.define_tag(name);
        let added = self.settings.toggle_tag(&board, no, name);
        self.persist_settings();
        self.rebuild_catalog();
        self.status_message = if added {
            format!("Tagged thread #{no} as \"{name}\".")
        } else {
            format!("Removed tag \"{name}\" from thread #{no}.")
        };
    }

    // ---- thread pane ----

    fn jump_to_post(&mut self, no: PostId) {
        let Some(view) = &self.thread else {
            return;
        };
        match view.position(no) {
            Some(idx) => {
                self.selected_post = idx;
                self.highlight = Some((no, Instant::now()));
                if idx < self.thread_offset.get() || idx > self.thread_last_visible.get() {
                    self.thread_offset.set(idx);
                }
                self.status_message = format!("Jumped to post #{no}.");
                self.ensure_media_for_selection();
            }
            None => {
                self.status_message = format!("Post #{no} not found in this thread.");
            }
        }
    }

    fn follow_selected_reply(&mut self) {
        let target = self.thread.as_ref().and_then(|view| {
            view.posts
                .get(self.selected_post)
                .and_then(|entry| entry.body.reply_targets().first().copied())
        });
        match target {
            Some(no) => self.jump_to_post(no),
            None => self.status_message = "Selected post has no reply links.".to_string(),
        }
    }

    fn toggle_reply_preview(&mut self) {
        if self.reply_preview.is_some() {
            self.reply_preview = None;
            return;
        }
        let target = self.thread.as_ref().and_then(|view| {
            view.posts
                .get(self.selected_post)
                .and_then(|entry| entry.body.reply_targets().first().copied())
        });
        let Some(no) = target else {
            self.status_message = "Selected post has no reply links.".to_string();
            return;
        };
        let resolves = self
            .thread
            .as_ref()
            .map(|view| view.position(no).is_some())
            .unwrap_or(false);
        if !resolves {
            self.status_message = format!("Post #{no} not found in this thread.");
            return;
        }
        let anchor = (POPUP_MARGIN, self.selected_row_y.get());
        self.reply_preview = Some(ReplyPreview { target: no, anchor });
    }

    fn open_image_overlay(&mut self) {
        let Some(view) = &self.thread else {
            return;
        };
        let Some(entry) = view.posts.get(self.selected_post) else {
            return;
        };
        let Some(image) = entry.post.image() else {
            self.status_message = "Selected post has no image.".to_string();
            return;
        };
        let url = self.client.image_url(&view.board, &image);
        let thumb = self.client.thumb_url(&view.board, &image);
        let board = view.board.clone();
        let no = entry.post.no;
        self.request_media(thumb, &image);
        self.image_overlay = Some(ImageOverlay {
            board,
            no,
            image,
            url,
        });
    }

    fn open_thread_in_browser(&mut self) {
        let Some(view) = &self.thread else {
            self.status_message = "No thread open.".to_string();
            return;
        };
        let url = thread_page_url(&view.board, view.no);
        match webbrowser::open(&url) {
            Ok(_) => self.status_message = "Thread opened in browser.".to_string(),
            Err(err) => self.status_message = format!("Failed to open browser: {err}"),
        }
    }

    fn copy_to_clipboard(&mut self, text: String, what: &str) {
        let outcome = Clipboard::new().and_then(|mut clipboard| clipboard.set_text(text));
        match outcome {
            Ok(()) => self.status_message = format!("{what} copied to clipboard."),
            Err(err) => self.status_message = format!("Clipboard failed: {err}"),
        }
    }

    fn copy_selected_permalink(&mut self) {
        match self.focused_pane {
            Pane::Catalog => {
                let Some(board) = self.current_board.clone() else {
                    return;
                };
                let Some(entry) = self.catalog_entries.get(self.selected_entry) else {
                    self.status_message = "No thread selected.".to_string();
                    return;
                };
                let url = thread_page_url(&board, entry.no);
                self.copy_to_clipboard(url, "Thread link");
            }
            Pane::Thread => {
                let Some(view) = &self.thread else {
                    return;
                };
                let url = thread_page_url(&view.board, view.no);
                self.copy_to_clipboard(url, "Thread link");
            }
            Pane::Boards => {}
        }
    }

    // ---- input handling ----

    fn handle_key(&mut self, code: KeyCode) -> Result<bool> {
        if self.input.is_some() {
            self.handle_input_key(code);
            return Ok(false);
        }
        if self.image_overlay.is_some() {
            self.handle_overlay_key(code);
            return Ok(false);
        }
        if self.settings_visible {
            self.handle_settings_key(code);
            return Ok(false);
        }
        if self.reply_preview.is_some()
            && matches!(code, KeyCode::Esc | KeyCode::Char('v') | KeyCode::Char('q'))
        {
            self.reply_preview = None;
            self.mark_dirty();
            return Ok(false);
        }

        let mut dirty = true;
        match code {
            KeyCode::Char('q') | KeyCode::Esc => return Ok(true),
            KeyCode::Char('m') => {
                self.settings_visible = true;
                self.settings_cursor = 0;
            }
            KeyCode::Char('h') | KeyCode::Left => {
                let previous = self.focused_pane.previous();
                if previous != self.focused_pane {
                    self.focused_pane = previous;
                    self.reply_preview = None;
                    self.zoom_preview = None;
                    self.sync_refresher();
                }
            }
            KeyCode::Char('l') | KeyCode::Right => {
                let next = self.focused_pane.next();
                if next != self.focused_pane {
                    self.focused_pane = next;
                    self.sync_refresher();
                }
            }
            KeyCode::Char('j') | KeyCode::Down => self.navigate_in_focus(1),
            KeyCode::Char('k') | KeyCode::Up => self.navigate_in_focus(-1),
            KeyCode::PageDown => self.navigate_in_focus(self.page_step()),
            KeyCode::PageUp => self.navigate_in_focus(-self.page_step()),
            KeyCode::Home => self.navigate_to_edge(true),
            KeyCode::End => self.navigate_to_edge(false),
            KeyCode::Enter => match self.focused_pane {
                Pane::Boards => self.commit_board_selection(),
                Pane::Catalog => self.open_selected_thread(),
                Pane::Thread => self.follow_selected_reply(),
            },
            KeyCode::Backspace => {
                if self.focused_pane == Pane::Thread {
                    self.focused_pane = Pane::Catalog;
                    self.reply_preview = None;
                    self.zoom_preview = None;
                    self.sync_refresher();
                }
            }
            KeyCode::Char('/') => match self.focused_pane {
                Pane::Boards => {
                    self.input = Some(InputState {
                        target: InputTarget::BoardSearch,
                        buffer: self.board_query.clone(),
                    });
                }
                Pane::Catalog => {
                    self.input = Some(InputState {
                        target: InputTarget::CatalogFilter,
                        buffer: self.catalog_query.clone(),
                    });
                }
                Pane::Thread => dirty = false,
            },
            KeyCode::Char('r') => match self.focused_pane {
                Pane::Boards => self.reload_boards(),
                Pane::Catalog => self.reload_catalog(true),
                Pane::Thread => {
                    if let Some(view) = &self.thread {
                        let board = view.board.clone();
                        let no = view.no;
                        self.reload_thread(board, no);
                    } else if let Some(pending) = &self.pending_thread {
                        let board = pending.board.clone();
                        let no = pending.no;
                        self.reload_thread(board, no);
                    } else if self.thread_error.is_some() {
                        self.status_message = "Nothing to retry.".to_string();
                    }
                }
            },
            KeyCode::Char('f') => {
                if self.focused_pane == Pane::Boards {
                    if let Some(row) = self.board_rows.get(self.selected_board) {
                        let code = row.code.clone();
                        let favored = self.settings.toggle_favorite(&code);
                        self.persist_settings();
                        self.rebuild_board_rows();
                        self.selected_board = self
                            .board_rows
                            .iter()
                            .position(|row| row.code == code)
                            .unwrap_or(0);
                        self.status_message = if favored {
                            format!("/{code}/ added to favorites.")
                        } else {
                            format!("/{code}/ removed from favorites.")
                        };
                    }
                } else {
                    dirty = false;
                }
            }
            KeyCode::Char('s') => {
                if self.focused_pane == Pane::Catalog {
                    self.catalog_sort = self.catalog_sort.cycle();
                    self.rebuild_catalog();
                    self.status_message =
                        format!("Sorted by {}.", self.catalog_sort.label());
                } else {
                    dirty = false;
                }
            }
            KeyCode::Char('i') => {
                if self.focused_pane == Pane::Catalog {
                    self.catalog_media = self.catalog_media.cycle();
                    self.rebuild_catalog();
                    self.status_message =
                        format!("Media filter: {}.", self.catalog_media.label());
                } else {
                    dirty = false;
                }
            }
            KeyCode::Char('p') => {
                if self.focused_pane == Pane::Catalog {
                    self.toggle_pin_selected();
                } else {
                    dirty = false;
                }
            }
            KeyCode::Char('w') => {
                if self.focused_pane == Pane::Catalog {
                    self.toggle_watch_selected();
                } else {
                    dirty = false;
                }
            }
            KeyCode::Char('t') => {
                if self.focused_pane == Pane::Catalog {
                    if self.catalog_entries.get(self.selected_entry).is_some() {
                        self.input = Some(InputState {
                            target: InputTarget::TagAssign,
                            buffer: String::new(),
                        });
                    } else {
                        self.status_message = "No thread selected.".to_string();
                    }
                } else {
                    dirty = false;
                }
            }
            KeyCode::Char('y') => self.copy_selected_permalink(),
            KeyCode::Char('v') => {
                if self.focused_pane == Pane::Thread {
                    self.toggle_reply_preview();
                } else {
                    dirty = false;
                }
            }
            KeyCode::Char('o') => {
                if self.focused_pane == Pane::Thread {
                    self.open_image_overlay();
                } else {
                    dirty = false;
                }
            }
            KeyCode::Char('b') => {
                if self.focused_pane == Pane::Thread {
                    self.open_thread_in_browser();
                } else {
                    dirty = false;
                }
            }
            _ => dirty = false,
        }

        if dirty {
            self.mark_dirty();
        }
        Ok(false)
    }

    fn handle_input_key(&mut self, code: KeyCode) {
        let Some(input) = &mut self.input else {
            return;
        };
        let target = input.target;
        match code {
            KeyCode::Esc => {
                self.input = None;
                match target {
                    InputTarget::BoardSearch => {
                        self.board_query.clear();
                        self.rebuild_board_rows();
                    }
                    InputTarget::CatalogFilter => {
                        self.catalog_query.clear();
                        self.rebuild_catalog();
                    }
                    InputTarget::TagName | InputTarget::TagAssign => {}
                }
            }
            KeyCode::Enter => {
                let buffer = input.buffer.clone();
                self.input = None;
                match target {
                    InputTarget::BoardSearch | InputTarget::CatalogFilter => {}
                    InputTarget::TagName => {
                        let name = buffer.trim();
                        if name.is_empty() {
                            self.status_message = "Tag name cannot be empty.".to_string();
                        } else if self.settings.define_tag(name) {
                            self.persist_settings();
                            self.status_message = format!("Tag \"{name}\" added.");
                        } else {
                            self.status_message = format!("Tag \"{name}\" already exists.");
                        }
                    }
                    InputTarget::TagAssign => self.assign_tag(&buffer),
                }
            }
            KeyCode::Backspace => {
                input.buffer.pop();
                self.apply_live_filter(target);
            }
            KeyCode::Char(ch) => {
                input.buffer.push(ch);
                self.apply_live_filter(target);
            }
            _ => {}
        }
        self.mark_dirty();
    }

    fn apply_live_filter(&mut self, target: InputTarget) {
        let Some(input) = &self.input else {
            return;
        };
        match target {
            InputTarget::BoardSearch => {
                self.board_query = input.buffer.clone();
                self.rebuild_board_rows();
            }
            InputTarget::CatalogFilter => {
                self.catalog_query = input.buffer.clone();
                self.rebuild_catalog();
            }
            InputTarget::TagName | InputTarget::TagAssign => {}
        }
    }

    fn handle_settings_key(&mut self, code: KeyCode) {
        match code {
            KeyCode::Esc | KeyCode::Char('q') | KeyCode::Char('m') => {
                self.settings_visible = false;
            }
            KeyCode::Char('j') | KeyCode::Down => {
                let len = self.settings_items().len();
                self.settings_cursor = (self.settings_cursor + 1).min(len.saturating_sub(1));
            }
            KeyCode::Char('k') | KeyCode::Up => {
                self.settings_cursor = self.settings_cursor.saturating_sub(1);
            }
            KeyCode::Enter | KeyCode::Char(' ') => self.toggle_settings_item(),
            KeyCode::Char('d') => self.delete_settings_tag(),
            _ => {}
        }
        self.mark_dirty();
    }

    fn handle_overlay_key(&mut self, code: KeyCode) {
        match code {
            KeyCode::Esc | KeyCode::Char('q') => {
                self.image_overlay = None;
            }
            KeyCode::Char('o') | KeyCode::Enter => {
                if let Some(overlay) = &self.image_overlay {
                    let url = overlay.url.clone();
                    match webbrowser::open(&url) {
                        Ok(_) => self.status_message = "Image opened in browser.".to_string(),
                        Err(err) => {
                            self.status_message = format!("Failed to open browser: {err}")
                        }
                    }
                }
            }
            KeyCode::Char('c') => {
                if let Some(overlay) = &self.image_overlay {
                    let url = overlay.url.clone();
                    self.copy_to_clipboard(url, "Image URL");
                }
            }
            _ => {}
        }
        self.mark_dirty();
    }

    fn handle_mouse(&mut self, event: MouseEvent) -> Result<()> {
        if self.settings_visible || self.image_overlay.is_some() {
            return Ok(());
        }
        match event.kind {
            MouseEventKind::ScrollUp => {
                self.navigate_in_focus(-1);
                self.mark_dirty();
            }
            MouseEventKind::ScrollDown => {
                self.navigate_in_focus(1);
                self.mark_dirty();
            }
            MouseEventKind::Down(MouseButton::Left) => {
                let target = self
                    .pane_areas
                    .iter()
                    .find(|(_, area)| rect_contains(*area, event.column, event.row))
                    .map(|(pane, _)| *pane);
                if let Some(pane) = target {
                    if pane != self.focused_pane {
                        self.focused_pane = pane;
                        self.sync_refresher();
                    }
                    if pane == Pane::Thread {
                        if let Some(idx) = self.thread_row_at(event.row) {
                            self.selected_post = idx;
                            self.ensure_media_for_selection();
                        }
                    }
                    self.mark_dirty();
                }
            }
            MouseEventKind::Moved => {
                self.update_zoom_preview(event.column, event.row);
            }
            _ => {}
        }
        Ok(())
    }

    fn thread_row_at(&self, row: u16) -> Option<usize> {
        self.thread_rows
            .iter()
            .find(|(top, bottom, _)| row >= *top && row < *bottom)
            .map(|(_, _, idx)| *idx)
    }

    fn update_zoom_preview(&mut self, column: u16, row: u16) {
        if !self.settings.hover_zoom {
            return;
        }
        let in_thread_pane = self
            .pane_areas
            .iter()
            .any(|(pane, area)| *pane == Pane::Thread && rect_contains(*area, column, row));
        let hovered = if in_thread_pane {
            self.thread_row_at(row).and_then(|idx| {
                let view = self.thread.as_ref()?;
                let entry = view.posts.get(idx)?;
                let image = entry.post.image()?;
                Some((self.client.thumb_url(&view.board, &image), image))
            })
        } else {
            None
        };

        match hovered {
            Some((url, image)) => {
                self.request_media(url.clone(), &image);
                let replace = self
                    .zoom_preview
                    .as_ref()
                    .map(|zoom| zoom.url != url || zoom.at != (column, row))
                    .unwrap_or(true);
                if replace {
                    self.zoom_preview = Some(ZoomPreview {
                        url,
                        image,
                        at: (column, row),
                    });
                    self.mark_dirty();
                }
            }
            None => {
                if self.zoom_preview.take().is_some() {
                    self.mark_dirty();
                }
            }
        }
    }

    fn page_step(&self) -> i32 {
        let visible = match self.focused_pane {
            Pane::Boards => self.board_rows_visible.get(),
            Pane::Catalog => self.catalog_rows_visible.get(),
            Pane::Thread => 5,
        };
        visible.max(1) as i32
    }

    fn navigate_in_focus(&mut self, delta: i32) {
        match self.focused_pane {
            Pane::Boards => {
                let len = self.board_rows.len();
                if len == 0 {
                    return;
                }
                let next = clamp_index(self.selected_board, delta, len);
                if next != self.selected_board {
                    self.selected_board = next;
                    let visible = self.board_rows_visible.get().max(1);
                    self.board_offset
                        .set(scrolled_offset(next, self.board_offset.get(), visible));
                }
            }
            Pane::Catalog => {
                let len = self.catalog_entries.len();
                if len == 0 {
                    return;
                }
                let next = clamp_index(self.selected_entry, delta, len);
                if next != self.selected_entry {
                    self.selected_entry = next;
                    let visible = self.catalog_rows_visible.get().max(1);
                    self.catalog_offset
                        .set(scrolled_offset(next, self.catalog_offset.get(), visible));
                }
            }
            Pane::Thread => {
                let len = self.thread.as_ref().map(|view| view.posts.len()).unwrap_or(0);
                if len == 0 {
                    return;
                }
                let next = clamp_index(self.selected_post, delta, len);
                if next != self.selected_post {
                    self.selected_post = next;
                    self.reply_preview = None;
                    if next < self.thread_offset.get() || next > self.thread_last_visible.get() {
                        self.thread_offset.set(next);
                    }
                    self.ensure_media_for_selection();
                }
            }
        }
        self.mark_dirty();
    }

    fn navigate_to_edge(&mut self, start: bool) {
        let len = match self.focused_pane {
            Pane::Boards => self.board_rows.len(),
            Pane::Catalog => self.catalog_entries.len(),
            Pane::Thread => self.thread.as_ref().map(|view| view.posts.len()).unwrap_or(0),
        };
        if len == 0 {
            return;
        }
        let target = if start { 0 } else { len - 1 };
        match self.focused_pane {
            Pane::Boards => {
                self.selected_board = target;
                let visible = self.board_rows_visible.get().max(1);
                self.board_offset
                    .set(scrolled_offset(target, self.board_offset.get(), visible));
            }
            Pane::Catalog => {
                self.selected_entry = target;
                let visible = self.catalog_rows_visible.get().max(1);
                self.catalog_offset
                    .set(scrolled_offset(target, self.catalog_offset.get(), visible));
            }
            Pane::Thread => {
                self.selected_post = target;
                self.thread_offset.set(target);
                self.ensure_media_for_selection();
            }
        }
        self.mark_dirty();
    }

    // ---- drawing ----

    fn draw(&mut self, frame: &mut Frame<'_>) {
        let full = frame.size();
        frame.render_widget(Block::default().style(Style::default().bg(self.theme.bg)), full);

        let layout = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(1),
                Constraint::Min(0),
                Constraint::Length(1),
            ])
            .split(full);

        self.draw_status_line(frame, layout[0]);

        let main_chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([
                Constraint::Percentage(20),
                Constraint::Percentage(40),
                Constraint::Percentage(40),
            ])
            .split(layout[1]);

        self.pane_areas = vec![
            (Pane::Boards, main_chunks[0]),
            (Pane::Catalog, main_chunks[1]),
            (Pane::Thread, main_chunks[2]),
        ];

        self.draw_boards(frame, main_chunks[0]);
        self.draw_catalog(frame, main_chunks[1]);
        self.draw_thread(frame, main_chunks[2]);

        let footer = Paragraph::new(self.footer_text())
            .style(
                Style::default()
                    .fg(self.theme.text_secondary)
                    .bg(self.theme.panel_bg)
                    .add_modifier(Modifier::ITALIC),
            )
            .alignment(Alignment::Center)
            .wrap(Wrap { trim: true });
        frame.render_widget(footer, layout[2]);

        if let Some(zoom) = &self.zoom_preview {
            self.draw_zoom_preview(frame, full, zoom);
        }
        if let Some(preview) = &self.reply_preview {
            self.draw_reply_preview(frame, full, preview);
        }
        if self.settings_visible {
            self.draw_settings(frame, layout[1]);
        }
        if self.image_overlay.is_some() {
            self.draw_image_overlay(frame, layout[1]);
        }
        if let Some(input) = &self.input {
            self.draw_input(frame, layout[1], input);
        }
    }

    fn draw_status_line(&self, frame: &mut Frame<'_>, area: Rect) {
        let status_text = if self.is_loading() {
            format!("{} {}", self.spinner.frame(), self.status_message)
                .trim()
                .to_string()
        } else {
            self.status_message.clone()
        };

        let geo_text = if self.settings.show_ip {
            let info = self.geo.clone().unwrap_or_else(geo::placeholder);
            format!("{} {}", info.flag, info.masked_ip)
        } else {
            String::new()
        };
        let geo_width = UnicodeWidthStr::width(geo_text.as_str()) as u16;

        let chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Min(0), Constraint::Length(geo_width + 1)])
            .split(area);

        let status_line = Paragraph::new(status_text).style(
            Style::default()
                .fg(self.theme.text_primary)
                .bg(self.theme.panel_focused_bg)
                .add_modifier(Modifier::BOLD),
        );
        frame.render_widget(status_line, chunks[0]);

        if !geo_text.is_empty() {
            let geo_line = Paragraph::new(geo_text).style(
                Style::default()
                    .fg(self.theme.text_secondary)
                    .bg(self.theme.panel_focused_bg),
            );
            frame.render_widget(geo_line, chunks[1]);
        }
    }

    fn pane_block(&self, pane: Pane) -> Block<'static> {
        let focused = self.focused_pane == pane;
        let border_style = if focused {
            Style::default().fg(self.theme.border_focused)
        } else {
            Style::default().fg(self.theme.border_idle)
        };
        let title_style = if focused {
            Style::default()
                .fg(self.theme.accent)
                .add_modifier(Modifier::BOLD)
        } else {
            Style::default().fg(self.theme.text_secondary)
        };
        Block::default()
            .title(Span::styled(pane.title(), title_style))
            .borders(Borders::ALL)
            .border_style(border_style)
            .style(Style::default().bg(self.theme.panel_bg))
            .padding(Padding::uniform(1))
    }

    fn draw_error_panel(&self, frame: &mut Frame<'_>, area: Rect, detail: &str) {
        let lines = vec![
            Line::from(Span::styled(
                "Load failed",
                Style::default()
                    .fg(self.theme.error)
                    .add_modifier(Modifier::BOLD),
            )),
            Line::default(),
            Line::from(Span::styled(
                detail.to_string(),
                Style::default().fg(self.theme.text_primary),
            )),
            Line::default(),
            Line::from(Span::styled(
                "Press r to retry.",
                Style::default().fg(self.theme.text_secondary),
            )),
        ];
        let panel = Paragraph::new(Text::from(lines)).wrap(Wrap { trim: true });
        frame.render_widget(panel, area);
    }

    fn draw_boards(&self, frame: &mut Frame<'_>, area: Rect) {
        let block = self.pane_block(Pane::Boards);
        let inner = block.inner(area);
        frame.render_widget(block, area);
        let focused = self.focused_pane == Pane::Boards;

        if let Some(detail) = &self.boards_error {
            self.draw_error_panel(frame, inner, detail);
            return;
        }

        let mut list_area = inner;
        if !self.board_query.is_empty() || self.input_target() == Some(InputTarget::BoardSearch) {
            let chunks = Layout::default()
                .direction(Direction::Vertical)
                .constraints([Constraint::Length(1), Constraint::Min(0)])
                .split(inner);
            let query = Paragraph::new(format!("/{}", self.board_query)).style(
                Style::default()
                    .fg(self.theme.accent)
                    .add_modifier(Modifier::BOLD),
            );
            frame.render_widget(query, chunks[0]);
            list_area = chunks[1];
        }

        let visible = list_area.height.max(1) as usize;
        self.board_rows_visible.set(visible);
        let offset = scrolled_offset(self.selected_board, self.board_offset.get(), visible);
        self.board_offset.set(offset);

        let mut items: Vec<ListItem> = Vec::new();
        for (idx, row) in self.board_rows.iter().enumerate().skip(offset).take(visible) {
            let is_selected = focused && idx == self.selected_board;
            let background = if is_selected {
                self.theme.panel_selected_bg
            } else {
                self.theme.panel_bg
            };
            let marker = if row.favorite { "★ " } else { "  " };
            let marker_style = Style::default().fg(self.theme.success).bg(background);
            let code_style = Style::default()
                .fg(if is_selected {
                    self.theme.text_primary
                } else {
                    self.theme.accent
                })
                .bg(background)
                .add_modifier(Modifier::BOLD);
            let title_style = Style::default()
                .fg(if is_selected {
                    self.theme.text_primary
                } else {
                    self.theme.text_secondary
                })
                .bg(background);
            let mut line = Line::from(vec![
                Span::styled(marker.to_string(), marker_style),
                Span::styled(format!("/{}/ ", row.code), code_style),
                Span::styled(row.title.clone(), title_style),
            ]);
            pad_line_to_width(&mut line, list_area.width);
            items.push(ListItem::new(vec![line]));
        }

        if items.is_empty() {
            let label = if self.board_query.is_empty() {
                "No boards"
            } else {
                "No boards match"
            };
            items.push(ListItem::new(vec![Line::from(Span::styled(
                label,
                Style::default()
                    .fg(self.theme.text_secondary)
                    .add_modifier(Modifier::ITALIC),
            ))]));
        }

        frame.render_widget(List::new(items), list_area);
    }

    fn draw_catalog(&self, frame: &mut Frame<'_>, area: Rect) {
        let block = self.pane_block(Pane::Catalog);
        let inner = block.inner(area);
        frame.render_widget(block, area);
        let focused = self.focused_pane == Pane::Catalog;

        if let Some(detail) = &self.catalog_error {
            self.draw_error_panel(frame, inner, detail);
            return;
        }
        if self.current_board.is_none() {
            let hint = Paragraph::new("Select a board to load its catalog.")
                .style(
                    Style::default()
                        .fg(self.theme.text_secondary)
                        .add_modifier(Modifier::ITALIC),
                )
                .wrap(Wrap { trim: true });
            frame.render_widget(hint, inner);
            return;
        }

        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Length(1), Constraint::Min(0)])
            .split(inner);

        let mut header_spans = vec![Span::styled(
            format!("sort: {}", self.catalog_sort.label()),
            Style::default().fg(self.theme.text_secondary),
        )];
        header_spans.push(Span::raw("  "));
        header_spans.push(Span::styled(
            format!("media: {}", self.catalog_media.label()),
            Style::default().fg(self.theme.text_secondary),
        ));
        if !self.catalog_query.is_empty()
            || self.input_target() == Some(InputTarget::CatalogFilter)
        {
            header_spans.push(Span::raw("  "));
            header_spans.push(Span::styled(
                format!("filter: {}", self.catalog_query),
                Style::default()
                    .fg(self.theme.accent)
                    .add_modifier(Modifier::BOLD),
            ));
        }
        frame.render_widget(Paragraph::new(Line::from(header_spans)), chunks[0]);

        let list_area = chunks[1];
        let visible = (list_area.height / 2).max(1) as usize;
        self.catalog_rows_visible.set(visible);
        let offset = scrolled_offset(self.selected_entry, self.catalog_offset.get(), visible);
        self.catalog_offset.set(offset);

        let mut items: Vec<ListItem> = Vec::new();
        for (idx, entry) in self
            .catalog_entries
            .iter()
            .enumerate()
            .skip(offset)
            .take(visible)
        {
            let is_selected = focused && idx == self.selected_entry;
            let background = if is_selected {
                self.theme.panel_selected_bg
            } else {
                self.theme.panel_bg
            };

            let mut title_spans = Vec::new();
            if entry.pinned {
                title_spans.push(Span::styled(
                    "📌 ",
                    Style::default().fg(self.theme.accent).bg(background),
                ));
            }
            if entry.watched {
                title_spans.push(Span::styled(
                    "👁 ",
                    Style::default().fg(self.theme.success).bg(background),
                ));
            }
            title_spans.push(Span::styled(
                entry.title.clone(),
                Style::default()
                    .fg(self.theme.text_primary)
                    .bg(background)
                    .add_modifier(Modifier::BOLD),
            ));
            title_spans.push(Span::styled(
                format!("  {}r/{}i", entry.replies, entry.images),
                Style::default().fg(self.theme.text_secondary).bg(background),
            ));

            let mut detail_spans = vec![Span::styled(
                format!("{} · {}", entry.author, entry.preview),
                Style::default().fg(self.theme.text_secondary).bg(background),
            )];
            for tag in &entry.tags {
                detail_spans.push(Span::styled(
                    format!(" #{tag}"),
                    Style::default().fg(self.theme.accent).bg(background),
                ));
            }

            let mut title_line = Line::from(title_spans);
            let mut detail_line = Line::from(detail_spans);
            pad_line_to_width(&mut title_line, list_area.width);
            pad_line_to_width(&mut detail_line, list_area.width);
            items.push(ListItem::new(vec![title_line, detail_line]));
        }

        if items.is_empty() {
            let label = if self.pending_catalog.is_some() {
                "Loading…"
            } else if self.catalog_query.is_empty() {
                "No threads"
            } else {
                "No threads match the filter"
            };
            items.push(ListItem::new(vec![Line::from(Span::styled(
                label,
                Style::default()
                    .fg(self.theme.text_secondary)
                    .add_modifier(Modifier::ITALIC),
            ))]));
        }

        frame.render_widget(List::new(items), list_area);
    }

    fn draw_thread(&mut self, frame: &mut Frame<'_>, area: Rect) {
        let block = self.pane_block(Pane::Thread);
        let inner = block.inner(area);
        frame.render_widget(block, area);
        self.thread_rows.clear();

        if let Some(detail) = &self.thread_error {
            self.draw_error_panel(frame, inner, detail);
            return;
        }
        let Some(view) = &self.thread else {
            let label = if self.pending_thread.is_some() {
                "Loading thread…"
            } else {
                "Open a thread from the catalog."
            };
            let hint = Paragraph::new(label)
                .style(
                    Style::default()
                        .fg(self.theme.text_secondary)
                        .add_modifier(Modifier::ITALIC),
                )
                .wrap(Wrap { trim: true });
            frame.render_widget(hint, inner);
            return;
        };

        let focused = self.focused_pane == Pane::Thread;
        let offset = self.thread_offset.get().min(view.posts.len().saturating_sub(1));
        let width = inner.width.max(1) as usize;
        let mut y = inner.y;
        let bottom = inner.y + inner.height;
        let mut last_drawn = offset;

        for (idx, entry) in view.posts.iter().enumerate().skip(offset) {
            if y >= bottom {
                break;
            }
            let is_selected = idx == self.selected_post;
            let highlighted = self
                .highlight
                .map(|(no, _)| no == entry.post.no)
                .unwrap_or(false);
            let background = if highlighted {
                self.theme.panel_focused_bg
            } else if is_selected && focused {
                self.theme.panel_selected_bg
            } else {
                self.theme.panel_bg
            };

            let mut lines: Vec<Line<'static>> = Vec::new();

            let time = Local
                .timestamp_opt(entry.post.time, 0)
                .single()
                .map(|at| comment::format_timestamp(at, Local::now()))
                .unwrap_or_default();
            let mut header_spans = Vec::new();
            if entry.body.is_reply() {
                header_spans.push(Span::styled(
                    "↪ ",
                    Style::default().fg(self.theme.text_secondary).bg(background),
                ));
            }
            header_spans.push(Span::styled(
                format!("{} ", entry.post.author()),
                Style::default()
                    .fg(self.theme.accent)
                    .bg(background)
                    .add_modifier(Modifier::BOLD),
            ));
            header_spans.push(Span::styled(
                format!("#{}", entry.post.no),
                Style::default().fg(self.theme.text_secondary).bg(background),
            ));
            if !time.is_empty() {
                header_spans.push(Span::styled(
                    format!("  {time}"),
                    Style::default().fg(self.theme.text_secondary).bg(background),
                ));
            }
            let reply_count = view.replies_to(entry.post.no).len();
            if reply_count > 0 {
                header_spans.push(Span::styled(
                    format!("  {reply_count}↩"),
                    Style::default().fg(self.theme.success).bg(background),
                ));
            }
            lines.push(Line::from(header_spans));

            if let Some(image) = entry.post.image() {
                let url = self.client.thumb_url(&view.board, &image);
                let note = if let Some(info) = self.media_info.get(&url) {
                    format!(
                        "[image: {} {}x{} {}]",
                        image.display_name(),
                        info.width,
                        info.height,
                        human_size(info.size_bytes)
                    )
                } else if self.media_failures.contains(&url) {
                    format!("[image unavailable: {}]", image.display_name())
                } else {
                    format!("[image: {}]", image.display_name())
                };
                lines.push(Line::from(Span::styled(
                    note,
                    Style::default()
                        .fg(self.theme.accent)
                        .bg(background)
                        .add_modifier(Modifier::ITALIC),
                )));
            }

            let body = comment::render_body(&entry.body);
            for line in body.lines {
                for wrapped in wrap_spans(line, width) {
                    lines.push(wrapped);
                }
            }
            lines.push(Line::default());

            for line in &mut lines {
                restyle_background(line, background);
                pad_line_to_width(line, inner.width);
            }

            let height = (lines.len() as u16).min(bottom.saturating_sub(y));
            let row_area = Rect::new(inner.x, y, inner.width, height);
            self.thread_rows.push((y, y + height, idx));
            if is_selected {
                self.selected_row_y.set(y);
            }
            frame.render_widget(Paragraph::new(Text::from(lines)), row_area);
            y += height;
            last_drawn = idx;
        }

        self.thread_last_visible.set(last_drawn);
    }

    fn draw_settings(&self, frame: &mut Frame<'_>, area: Rect) {
        let popup_area = centered_rect(60, 70, area);
        frame.render_widget(Clear, popup_area);

        let items = self.settings_items();
        let mut lines: Vec<Line> = Vec::with_capacity(items.len() + 2);
        for (idx, item) in items.iter().enumerate() {
            let active = idx == self.settings_cursor;
            let marker = if active { "> " } else { "  " };
            let base = Style::default()
                .fg(if active {
                    self.theme.text_primary
                } else {
                    self.theme.text_secondary
                })
                .bg(if active {
                    self.theme.panel_selected_bg
                } else {
                    self.theme.panel_bg
                });
            let label = match item {
                SettingsItem::AutoRefresh => {
                    format!("[{}] Auto-refresh", check(self.settings.auto_refresh))
                }
                SettingsItem::HoverZoom => {
                    format!("[{}] Hover zoom previews", check(self.settings.hover_zoom))
                }
                SettingsItem::ShowIp => {
                    format!("[{}] Show IP in status line", check(self.settings.show_ip))
                }
                SettingsItem::HighContrast => {
                    format!("[{}] High contrast theme", check(self.settings.high_contrast))
                }
                SettingsItem::Tag(idx) => {
                    let name = self
                        .settings
                        .thread_tags
                        .get(*idx)
                        .map(String::as_str)
                        .unwrap_or("");
                    format!("#{name}  (d deletes)")
                }
                SettingsItem::AddTag => "+ Add tag…".to_string(),
            };
            lines.push(Line::from(Span::styled(format!("{marker}{label}"), base)));
        }
        lines.push(Line::default());
        lines.push(Line::from(Span::styled(
            "j/k move · Enter toggle · d delete tag · Esc close",
            Style::default()
                .fg(self.theme.text_secondary)
                .add_modifier(Modifier::ITALIC),
        )));

        let popup = Paragraph::new(Text::from(lines))
            .block(
                Block::default()
                    .title(Span::styled(
                        " Settings ",
                        Style::default()
                            .fg(self.theme.accent)
                            .add_modifier(Modifier::BOLD),
                    ))
                    .borders(Borders::ALL)
                    .border_style(Style::default().fg(self.theme.accent))
                    .style(Style::default().bg(self.theme.panel_bg))
                    .padding(Padding::uniform(1)),
            )
            .wrap(Wrap { trim: false });
        frame.render_widget(popup, popup_area);
    }

    fn draw_image_overlay(&self, frame: &mut Frame<'_>, area: Rect) {
        let Some(overlay) = &self.image_overlay else {
            return;
        };
        let popup_area = centered_rect(60, 50, area);
        frame.render_widget(Clear, popup_area);

        let thumb = self
            .client
            .thumb_url(&overlay.board, &overlay.image);
        let mut lines = vec![
            Line::from(Span::styled(
                overlay.image.display_name(),
                Style::default()
                    .fg(self.theme.text_primary)
                    .add_modifier(Modifier::BOLD),
            )),
            Line::default(),
            Line::from(Span::styled(
                format!(
                    "{}x{} · {}",
                    overlay.image.width,
                    overlay.image.height,
                    human_size(overlay.image.size_bytes)
                ),
                Style::default().fg(self.theme.text_secondary),
            )),
            Line::from(Span::styled(
                format!("/{}/ #{}", overlay.board, overlay.no),
                Style::default().fg(self.theme.text_secondary),
            )),
            Line::default(),
            Line::from(Span::styled(
                overlay.url.clone(),
                Style::default().fg(self.theme.accent),
            )),
        ];
        if let Some(info) = self.media_info.get(&thumb) {
            lines.push(Line::from(Span::styled(
                format!("thumbnail cached: {} ({})", info.file_path, info.media_type),
                Style::default().fg(self.theme.success),
            )));
        } else if self.pending_media.contains(&thumb) {
            lines.push(Line::from(Span::styled(
                "fetching thumbnail…",
                Style::default().fg(self.theme.text_secondary),
            )));
        } else if self.media_failures.contains(&thumb) {
            lines.push(Line::from(Span::styled(
                "thumbnail unavailable",
                Style::default().fg(self.theme.error),
            )));
        }
        lines.push(Line::default());
        lines.push(Line::from(Span::styled(
            "o open in browser · c copy URL · Esc close",
            Style::default()
                .fg(self.theme.text_secondary)
                .add_modifier(Modifier::ITALIC),
        )));

        let popup = Paragraph::new(Text::from(lines))
            .block(
                Block::default()
                    .title(Span::styled(
                        " Image ",
                        Style::default()
                            .fg(self.theme.accent)
                            .add_modifier(Modifier::BOLD),
                    ))
                    .borders(Borders::ALL)
                    .border_style(Style::default().fg(self.theme.accent))
                    .style(Style::default().bg(self.theme.panel_bg))
                    .padding(Padding::uniform(1)),
            )
            .wrap(Wrap { trim: false });
        frame.render_widget(popup, popup_area);
    }

    fn draw_reply_preview(&self, frame: &mut Frame<'_>, bounds: Rect, preview: &ReplyPreview) {
        let Some(view) = &self.thread else {
            return;
        };
        let Some(entry) = view.post(preview.target) else {
            return;
        };

        let time = Local
            .timestamp_opt(entry.post.time, 0)
            .single()
            .map(|at| comment::format_timestamp(at, Local::now()))
            .unwrap_or_default();
        let mut lines = vec![Line::from(vec![
            Span::styled(
                format!("{} #{}", entry.post.author(), entry.post.no),
                Style::default()
                    .fg(self.theme.text_primary)
                    .add_modifier(Modifier::BOLD),
            ),
            Span::styled(
                format!("  {time}"),
                Style::default().fg(self.theme.text_secondary),
            ),
        ])];
        lines.push(Line::from(Span::styled(
            entry.body.preview(REPLY_PREVIEW_CHARS),
            Style::default().fg(self.theme.text_primary),
        )));
        if let Some(image) = entry.post.image() {
            lines.push(Line::from(Span::styled(
                format!("[image: {}]", image.display_name()),
                Style::default()
                    .fg(self.theme.accent)
                    .add_modifier(Modifier::ITALIC),
            )));
        }

        let width = (REPLY_PREVIEW_CHARS as u16 + 6).min(bounds.width.saturating_sub(2));
        let height = lines.len() as u16 + 2;
        let (x, y) = clamp_popup(
            preview.anchor,
            (width, height),
            (bounds.width, bounds.height),
            POPUP_MARGIN,
        );
        let popup_area = Rect::new(
            x.min(bounds.width.saturating_sub(width)),
            y.min(bounds.height.saturating_sub(height)),
            width.min(bounds.width),
            height.min(bounds.height),
        );
        frame.render_widget(Clear, popup_area);
        let popup = Paragraph::new(Text::from(lines))
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .border_style(Style::default().fg(self.theme.accent))
                    .style(Style::default().bg(self.theme.panel_bg)),
            )
            .wrap(Wrap { trim: true });
        frame.render_widget(popup, popup_area);
    }

    fn draw_zoom_preview(&self, frame: &mut Frame<'_>, bounds: Rect, zoom: &ZoomPreview) {
        let mut lines = vec![Line::from(Span::styled(
            zoom.image.display_name(),
            Style::default()
                .fg(self.theme.text_primary)
                .add_modifier(Modifier::BOLD),
        ))];
        let detail = if let Some(info) = self.media_info.get(&zoom.url) {
            format!(
                "{}x{} · {} · {}",
                info.width,
                info.height,
                human_size(info.size_bytes),
                info.media_type
            )
        } else if self.media_failures.contains(&zoom.url) {
            "preview unavailable".to_string()
        } else {
            format!(
                "{}x{} · {}",
                zoom.image.width,
                zoom.image.height,
                human_size(zoom.image.size_bytes)
            )
        };
        lines.push(Line::from(Span::styled(
            detail,
            Style::default().fg(self.theme.text_secondary),
        )));

        let width = lines
            .iter()
            .map(|line| {
                line.spans
                    .iter()
                    .map(|span| UnicodeWidthStr::width(span.content.as_ref()))
                    .sum::<usize>()
            })
            .max()
            .unwrap_or(0) as u16
            + 4;
        let height = lines.len() as u16 + 2;
        let (x, y) = clamp_popup(zoom.at, (width, height), (bounds.width, bounds.height), POPUP_MARGIN);
        let popup_area = Rect::new(
            x.min(bounds.width.saturating_sub(width)),
            y.min(bounds.height.saturating_sub(height)),
            width.min(bounds.width),
            height.min(bounds.height),
        );
        frame.render_widget(Clear, popup_area);
        let popup = Paragraph::new(Text::from(lines)).block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.border_focused))
                .style(Style::default().bg(self.theme.panel_bg)),
        );
        frame.render_widget(popup, popup_area);
    }

    fn draw_input(&self, frame: &mut Frame<'_>, area: Rect, input: &InputState) {
        let title = match input.target {
            InputTarget::BoardSearch => " Search boards ",
            InputTarget::CatalogFilter => " Filter threads ",
            InputTarget::TagName => " New tag ",
            InputTarget::TagAssign => " Tag thread ",
        };
        let popup_area = centered_rect(50, 20, area);
        frame.render_widget(Clear, popup_area);
        let body = Text::from(vec![
            Line::from(Span::styled(
                format!("{}▌", input.buffer),
                Style::default().fg(self.theme.text_primary),
            )),
            Line::default(),
            Line::from(Span::styled(
                "Enter confirm · Esc cancel",
                Style::default()
                    .fg(self.theme.text_secondary)
                    .add_modifier(Modifier::ITALIC),
            )),
        ]);
        let popup = Paragraph::new(body)
            .block(
                Block::default()
                    .title(Span::styled(
                        title,
                        Style::default()
                            .fg(self.theme.accent)
                            .add_modifier(Modifier::BOLD),
                    ))
                    .borders(Borders::ALL)
                    .border_style(Style::default().fg(self.theme.accent))
                    .style(Style::default().bg(self.theme.panel_bg))
                    .padding(Padding::uniform(1)),
            )
            .wrap(Wrap { trim: false });
        frame.render_widget(popup, popup_area);
    }

    fn input_target(&self) -> Option<InputTarget> {
        self.input.as_ref().map(|input| input.target)
    }

    fn footer_text(&self) -> String {
        if self.input.is_some() {
            return "Type to edit · Enter confirm · Esc cancel".to_string();
        }
        if self.settings_visible {
            return "Settings: j/k move · Enter toggle · d delete tag · Esc close".to_string();
        }
        if self.image_overlay.is_some() {
            return "Image: o open in browser · c copy URL · Esc close".to_string();
        }
        match self.focused_pane {
            Pane::Boards => {
                "Boards: j/k move · Enter open · f favorite · / search · r reload · m settings · q quit"
                    .to_string()
            }
            Pane::Catalog => {
                "Catalog: Enter open · / filter · s sort · i media · p pin · t tag · w watch · y copy link · r refresh"
                    .to_string()
            }
            Pane::Thread => {
                "Thread: Enter follow reply · v preview · o image · b browser · y copy link · Backspace back · r refresh"
                    .to_string()
            }
        }
    }
}

// ---- pure helpers ----

fn check(on: bool) -> &'static str {
    if on {
        "x"
    } else {
        " "
    }
}

fn human_size(bytes: i64) -> String {
    if bytes >= 1024 * 1024 {
        format!("{:.1} MiB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.1} KiB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}

fn thread_page_url(board: &str, no: PostId) -> String {
    format!("{BOARD_PAGE_BASE}/{board}/thread/{no}")
}

fn rect_contains(rect: Rect, x: u16, y: u16) -> bool {
    x >= rect.x && x < rect.x + rect.width && y >= rect.y && y < rect.y + rect.height
}

fn clamp_index(current: usize, delta: i32, len: usize) -> usize {
    let next = current as i64 + delta as i64;
    next.clamp(0, len.saturating_sub(1) as i64) as usize
}

/// Keeps `selected` inside the `visible`-row window starting at `offset`.
fn scrolled_offset(selected: usize, offset: usize, visible: usize) -> usize {
    let visible = visible.max(1);
    if selected < offset {
        selected
    } else if selected >= offset + visible {
        selected + 1 - visible
    } else {
        offset
    }
}

/// Popup placement: below-right of the anchor, flipped above/left when it
/// would run past the bounds, never closer to an edge than `margin`.
fn clamp_popup(
    anchor: (u16, u16),
    size: (u16, u16),
    bounds: (u16, u16),
    margin: u16,
) -> (u16, u16) {
    let (ax, ay) = anchor;
    let (width, height) = size;
    let (bound_w, bound_h) = bounds;

    let mut x = ax.saturating_add(margin);
    let mut y = ay.saturating_add(margin);
    if x.saturating_add(width) > bound_w.saturating_sub(margin) {
        x = ax.saturating_sub(width).saturating_sub(margin);
    }
    if y.saturating_add(height) > bound_h.saturating_sub(margin) {
        y = ay.saturating_sub(height).saturating_sub(margin);
    }
    (x.max(margin), y.max(margin))
}

/// Favorites first in their saved order, then the rest in API order; a query
/// switches to fuzzy matching over code and title, best matches first.
fn filter_boards(boards: &[Board], favorites: &[String], query: &str) -> Vec<BoardRow> {
    let row = |board: &Board| BoardRow {
        code: board.board.clone(),
        title: board.title.clone(),
        favorite: favorites.iter().any(|code| *code == board.board),
    };

    if query.trim().is_empty() {
        let mut rows: Vec<BoardRow> = Vec::with_capacity(boards.len());
        for code in favorites {
            if let Some(board) = boards.iter().find(|board| board.board == *code) {
                rows.push(row(board));
            }
        }
        for board in boards {
            if !favorites.iter().any(|code| *code == board.board) {
                rows.push(row(board));
            }
        }
        return rows;
    }

    let matcher = SkimMatcherV2::default();
    let mut scored: Vec<(i64, BoardRow)> = boards
        .iter()
        .filter_map(|board| {
            let haystack = format!("{} {} {}", board.board, board.title, board.meta_description);
            matcher
                .fuzzy_match(&haystack, query.trim())
                .map(|score| (score, row(board)))
        })
        .collect();
    scored.sort_by_key(|(score, row)| (std::cmp::Reverse(row.favorite), std::cmp::Reverse(*score)));
    scored.into_iter().map(|(_, row)| row).collect()
}

/// Chooses where the selection lands after a rebuild: the same thread if it
/// is still shown, otherwise the nearest valid index.
fn retained_selection(entries: &[CatalogEntry], previous: Option<PostId>) -> usize {
    if let Some(no) = previous {
        if let Some(idx) = entries.iter().position(|entry| entry.no == no) {
            return idx;
        }
    }
    0
}

fn pad_line_to_width(line: &mut Line<'static>, width: u16) {
    let width = width as usize;
    if width == 0 {
        return;
    }
    let current: usize = line
        .spans
        .iter()
        .map(|span| UnicodeWidthStr::width(span.content.as_ref()))
        .sum();
    if current >= width {
        return;
    }
    let pad_style = line.spans.last().map(|span| span.style).unwrap_or_default();
    line.spans
        .push(Span::styled(" ".repeat(width - current), pad_style));
}

fn restyle_background(line: &mut Line<'static>, background: Color) {
    for span in &mut line.spans {
        span.style = span.style.bg(background);
    }
}

/// Wraps one styled line to `width` columns, keeping each span's style on its
/// wrapped pieces. Word-agnostic: splits on character boundaries.
fn wrap_spans(line: Line<'static>, width: usize) -> Vec<Line<'static>> {
    let width = width.max(1);
    let mut out: Vec<Line<'static>> = Vec::new();
    let mut current: Vec<Span<'static>> = Vec::new();
    let mut used = 0usize;

    for span in line.spans {
        let style = span.style;
        let mut piece = String::new();
        for ch in span.content.chars() {
            let ch_width = UnicodeWidthStr::width(ch.to_string().as_str());
            if used + ch_width > width && used > 0 {
                if !piece.is_empty() {
                    current.push(Span::styled(std::mem::take(&mut piece), style));
                }
                out.push(Line::from(std::mem::take(&mut current)));
                used = 0;
            }
            piece.push(ch);
            used += ch_width;
        }
        if !piece.is_empty() {
            current.push(Span::styled(piece, style));
        }
    }
    if !current.is_empty() || out.is_empty() {
        out.push(Line::from(current));
    }
    out
}

fn centered_rect(percent_x: u16, percent_y: u16, area: Rect) -> Rect {
    let percent_x = percent_x.min(100);
    let percent_y = percent_y.min(100);
    let horizontal = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage(100 - percent_x - (100 - percent_x) / 2),
        ])
        .split(area);
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage(100 - percent_y - (100 - percent_y) / 2),
        ])
        .split(horizontal[1]);
    vertical[1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{MockBoardService, MockCatalogService, MockThreadService};
    use crate::settings::MemorySettings;
    use crate::storage::{Options, Store};
    use ratatui::backend::TestBackend;
    use tempfile::tempdir;

    fn board(code: &str, title: &str) -> Board {
        Board {
            board: code.to_string(),
            title: title.to_string(),
            meta_description: String::new(),
        }
    }

    #[test]
    fn popup_sits_below_right_of_anchor() {
        let at = clamp_popup((10, 5), (20, 6), (100, 40), 2);
        assert_eq!(at, (12, 7));
    }

    #[test]
    fn popup_flips_left_and_up_near_the_far_edges() {
        let (x, y) = clamp_popup((95, 38), (20, 6), (100, 40), 2);
        assert_eq!(x, 95 - 20 - 2);
        assert_eq!(y, 38 - 6 - 2);
    }

    #[test]
    fn popup_never_crosses_the_margin() {
        let at = clamp_popup((0, 0), (200, 100), (100, 40), 2);
        assert_eq!(at, (2, 2));
    }

    #[test]
    fn favorites_lead_the_board_list() {
        let boards = vec![
            board("a", "Anime"),
            board("g", "Technology"),
            board("v", "Video Games"),
        ];
        let favorites = vec!["v".to_string(), "a".to_string()];
        let rows = filter_boards(&boards, &favorites, "");
        let codes: Vec<&str> = rows.iter().map(|row| row.code.as_str()).collect();
        assert_eq!(codes, vec!["v", "a", "g"]);
        assert!(rows[0].favorite && rows[1].favorite && !rows[2].favorite);
    }

    #[test]
    fn board_search_is_fuzzy_over_code_and_title() {
        let boards = vec![
            board("a", "Anime"),
            board("g", "Technology"),
            board("tv", "Television & Film"),
        ];
        let rows = filter_boards(&boards, &[], "tech");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].code, "g");

        let rows = filter_boards(&boards, &[], "t");
        assert!(rows.iter().any(|row| row.code == "g"));
        assert!(rows.iter().any(|row| row.code == "tv"));
    }

    #[test]
    fn favorite_outranks_better_score_in_search() {
        let boards = vec![board("g", "Technology"), board("gif", "Animated GIFs")];
        let favorites = vec!["gif".to_string()];
        let rows = filter_boards(&boards, &favorites, "g");
        assert_eq!(rows[0].code, "gif");
    }

    #[test]
    fn selection_survives_a_rebuild_when_the_thread_is_still_shown() {
        let entries = vec![entry(10), entry(20), entry(30)];
        assert_eq!(retained_selection(&entries, Some(20)), 1);
        assert_eq!(retained_selection(&entries, Some(99)), 0);
        assert_eq!(retained_selection(&entries, None), 0);
    }

    #[test]
    fn window_offset_follows_the_selection() {
        assert_eq!(scrolled_offset(0, 0, 5), 0);
        assert_eq!(scrolled_offset(4, 0, 5), 0);
        assert_eq!(scrolled_offset(5, 0, 5), 1);
        assert_eq!(scrolled_offset(2, 4, 5), 2);
        assert_eq!(scrolled_offset(9, 1, 3), 7);
    }

    #[test]
    fn wrapped_spans_keep_their_styles() {
        let style = Style::default().fg(Color::Green);
        let line = Line::from(vec![Span::styled("abcdefghij", style)]);
        let wrapped = wrap_spans(line, 4);
        assert_eq!(wrapped.len(), 3);
        assert_eq!(wrapped[0].spans[0].content.as_ref(), "abcd");
        assert_eq!(wrapped[0].spans[0].style, style);
        assert_eq!(wrapped[2].spans[0].content.as_ref(), "ij");
    }

    fn entry(no: PostId) -> CatalogEntry {
        CatalogEntry {
            no,
            title: format!("Thread #{no}"),
            author: "Anonymous".to_string(),
            preview: String::new(),
            replies: 0,
            images: 0,
            pinned: false,
            watched: false,
            tags: Vec::new(),
            image: None,
            time: 0,
        }
    }

    fn model_with_mocks(dir: &tempfile::TempDir) -> Model {
        let store = Store::open(Options {
            path: Some(dir.path().join("state.db")),
        })
        .unwrap();
        let catalogs = Arc::new(CachedCatalogService::new(
            Arc::new(MockCatalogService),
            store,
            Duration::from_secs(3600),
        ));
        let client = Arc::new(
            chan::Client::new(chan::ClientConfig {
                user_agent: "chan-tui-tests/0.1".to_string(),
                api_base: None,
                media_base: None,
                policy: chan::FetchPolicy::default(),
                http_client: None,
            })
            .unwrap(),
        );
        Model::new(ModelOptions {
            boards: Arc::new(MockBoardService),
            catalogs,
            threads: Arc::new(MockThreadService),
            settings: Arc::new(MemorySettings::new(Settings::default())),
            media: None,
            client,
            refresh_period: Duration::from_secs(3600),
            theme: "default".to_string(),
        })
    }

    fn drain_until(model: &mut Model, ready: impl Fn(&Model) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !ready(model) {
            assert!(Instant::now() < deadline, "async response never arrived");
            model.poll_async();
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn opening_a_board_fills_the_catalog_pane() {
        let dir = tempdir().unwrap();
        let mut model = model_with_mocks(&dir);
        model.open_board("g".to_string());
        drain_until(&mut model, |m| !m.catalog_entries.is_empty());
        assert_eq!(model.focused_pane, Pane::Catalog);
        assert_eq!(model.catalog_entries[0].no, 1000);
        assert_eq!(model.catalog_entries[0].title, "Welcome to /g/");
    }

    #[test]
    fn reply_preview_draws_inside_a_tiny_terminal() {
        let dir = tempdir().unwrap();
        let mut model = model_with_mocks(&dir);
        model.current_board = Some("g".to_string());
        model.focused_pane = Pane::Thread;
        let thread = MockThreadService.load_thread("g", 1000).unwrap();
        model.thread = Some(ThreadView::build("g", 1000, thread));
        model.reply_preview = Some(ReplyPreview {
            target: 1000,
            anchor: (0, 0),
        });

        let mut terminal = Terminal::new(TestBackend::new(40, 3)).unwrap();
        terminal.draw(|frame| model.draw(frame)).unwrap();
    }
}
