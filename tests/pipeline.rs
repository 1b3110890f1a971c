use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;
use tempfile::tempdir;

use saved_gallery::api::{BackendClient, LibrarySource};
use saved_gallery::error::{Error, Result};
use saved_gallery::library::Library;
use saved_gallery::media::MediaType;
use saved_gallery::model::Post;
use saved_gallery::ordering::OrderMode;
use saved_gallery::paginator::{Page, PageSource};
use saved_gallery::server::{Backend, State};
use saved_gallery::session::{Controller, Options};
use saved_gallery::storage::MemoryStore;
use saved_gallery::trigger::TriggerState;

const WAIT: Duration = Duration::from_secs(5);

struct Scripted {
    pages: Mutex<VecDeque<Result<Page>>>,
    calls: Mutex<usize>,
}

impl Scripted {
    fn new(pages: Vec<Result<Page>>) -> Arc<Self> {
        Arc::new(Self {
            pages: Mutex::new(pages.into()),
            calls: Mutex::new(0),
        })
    }

    fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

impl PageSource for Scripted {
    fn fetch_page(&self, _cursor: Option<&str>) -> Result<Page> {
        *self.calls.lock() += 1;
        self.pages
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(Page::default()))
    }

    fn describe(&self) -> String {
        "scripted".into()
    }
}

/// Holds its single response until the test lets it go.
struct Gated {
    release: Receiver<()>,
}

impl PageSource for Gated {
    fn fetch_page(&self, _cursor: Option<&str>) -> Result<Page> {
        let _ = self.release.recv_timeout(WAIT);
        Ok(Page::new(vec![post("stale", "https://i.redd.it/stale.jpg", 1.0)], None))
    }

    fn describe(&self) -> String {
        "gated".into()
    }
}

fn post(id: &str, url: &str, created: f64) -> Post {
    Post {
        id: id.into(),
        title: format!("post {id}"),
        url: url.into(),
        subreddit: "pics".into(),
        created_utc: created,
        ..Post::default()
    }
}

fn image(id: &str) -> Post {
    post(id, &format!("https://i.redd.it/{id}.jpg"), 1.0)
}

fn session(source: Arc<dyn PageSource>, order: OrderMode) -> Controller {
    Controller::new(
        source,
        Arc::new(MemoryStore::new()),
        Options {
            lookahead: 1,
            debounce: Duration::from_millis(50),
            order,
        },
    )
}

fn ids(view: &[Arc<Post>]) -> Vec<String> {
    view.iter().map(|post| post.id.clone()).collect()
}

#[test]
fn empty_first_page_exhausts_without_refetching() {
    let source = Scripted::new(vec![Ok(Page::default())]);
    let mut s = session(source.clone(), OrderMode::Stable);
    assert!(s.start());
    assert!(s.wait_idle(WAIT));

    assert!(!s.has_more());
    assert_eq!(s.trigger_state(), TriggerState::Exhausted);
    assert!(!s.on_visible(0));
    assert!(!s.load_more());
    assert_eq!(source.calls(), 1);
}

#[test]
fn filter_by_type_keeps_relative_order() {
    let source = Scripted::new(vec![Ok(Page::new(
        vec![
            post("a", "https://i.redd.it/a.jpg", 100.0),
            post("b", "https://example.com/b.mp4", 200.0),
            post("c", "https://example.com/c.gif", 50.0),
        ],
        None,
    ))]);
    let mut s = session(source, OrderMode::Stable);
    s.start();
    assert!(s.wait_idle(WAIT));

    s.set_media_types([MediaType::Image, MediaType::Video]);
    assert_eq!(ids(s.view()), ["a", "b"]);
    assert_eq!(s.source_list().len(), 3);
}

#[test]
fn later_pages_extend_the_source_list() {
    let source = Scripted::new(vec![
        Ok(Page::new(vec![image("a"), image("b")], Some("t3_b".into()))),
        Ok(Page::new(vec![image("c")], None)),
    ]);
    let mut s = session(source, OrderMode::Random);
    s.start();
    assert!(s.wait_idle(WAIT));
    let before: Vec<String> = s
        .source_list()
        .records()
        .iter()
        .map(|post| post.id.clone())
        .collect();

    let shown = ids(s.view());
    let last = shown.len() - 1;
    assert!(s.on_visible(last));
    assert!(s.wait_idle(WAIT));
    let after: Vec<String> = s
        .source_list()
        .records()
        .iter()
        .map(|post| post.id.clone())
        .collect();

    assert_eq!(&after[..before.len()], &before[..]);
    assert_eq!(after.len(), 3);
    assert_eq!(ids(s.view())[..shown.len()], shown[..]);
    assert_eq!(s.pages_loaded(), 2);
    assert!(!s.has_more());
}

#[test]
fn response_for_old_source_is_dropped_after_reset() {
    let (release_tx, release_rx) = bounded(1);
    let mut s = session(Arc::new(Gated { release: release_rx }), OrderMode::Stable);
    assert!(s.start());

    let fresh = Scripted::new(vec![Ok(Page::new(vec![image("fresh")], None))]);
    s.reset(fresh);
    assert!(s.start());
    assert!(s.wait_idle(WAIT));
    assert_eq!(ids(s.view()), ["fresh"]);

    release_tx.send(()).unwrap();
    let deadline = Instant::now() + WAIT;
    while s.poll() == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(ids(s.view()), ["fresh"]);
    assert_eq!(s.pages_loaded(), 1);
}

#[test]
fn failed_page_keeps_what_was_loaded() {
    let source = Scripted::new(vec![
        Ok(Page::new(vec![image("a")], Some("t3_a".into()))),
        Err(Error::Network("connection reset".into())),
        Ok(Page::new(vec![image("b")], None)),
    ]);
    let mut s = session(source.clone(), OrderMode::Stable);
    s.start();
    assert!(s.wait_idle(WAIT));
    assert!(s.on_visible(0));
    assert!(s.wait_idle(WAIT));

    assert!(matches!(s.last_error(), Some(Error::Network(_))));
    assert_eq!(ids(s.view()), ["a"]);
    assert_eq!(s.trigger_state(), TriggerState::Idle);

    assert!(s.retry());
    assert!(s.wait_idle(WAIT));
    assert!(s.last_error().is_none());
    assert_eq!(ids(s.view()), ["a", "b"]);
    assert_eq!(source.calls(), 3);
}

#[test]
fn expired_token_is_not_retried_by_scrolling() {
    let source = Scripted::new(vec![
        Ok(Page::new(vec![image("a")], Some("t3_a".into()))),
        Err(Error::Auth("token expired".into())),
    ]);
    let mut s = session(source.clone(), OrderMode::Stable);
    s.start();
    assert!(s.wait_idle(WAIT));
    assert!(s.on_visible(0));
    assert!(s.wait_idle(WAIT));

    assert_eq!(s.trigger_state(), TriggerState::Blocked);
    assert!(!s.on_visible(0));
    assert_eq!(source.calls(), 2);
    assert_eq!(ids(s.view()), ["a"]);
}

#[test]
fn reshuffle_draws_a_new_order() {
    let posts: Vec<Post> = (0..30).map(|n| image(&format!("p{n}"))).collect();
    let source = Scripted::new(vec![Ok(Page::new(posts, None))]);
    let mut s = session(source, OrderMode::Random);
    s.start();
    assert!(s.wait_idle(WAIT));

    let first = ids(s.view());
    let all: HashSet<&String> = first.iter().collect();
    assert_eq!(all.len(), 30);

    let mut changed = false;
    for _ in 0..5 {
        assert!(s.reshuffle());
        if ids(s.view()) != first {
            changed = true;
            break;
        }
    }
    assert!(changed);

    s.set_mode(OrderMode::Stable);
    assert!(!s.reshuffle());
    let stable = ids(s.view());
    assert_eq!(stable[0], "p0");
    assert_eq!(stable[29], "p29");
}

#[test]
fn library_pages_flow_through_the_backend() {
    let dir = tempdir().unwrap();
    std::fs::create_dir(dir.path().join("trips")).unwrap();
    for name in ["beach_day.jpg", "clip.webm", "trips/mountain-view.png", "notes.txt"] {
        std::fs::write(dir.path().join(name), b"data").unwrap();
    }
    let library = Arc::new(Library::new(dir.path(), Duration::from_secs(60)).unwrap());
    let backend = Backend::bind("127.0.0.1:0", State::new(None, Some(library), 2), 2).unwrap();
    let base = format!("http://{}", backend.local_addr());
    thread::spawn(move || backend.run());

    let client = Arc::new(BackendClient::new(&base).unwrap());
    let mut s = session(Arc::new(LibrarySource::new(client, 2)), OrderMode::Stable);
    s.start();
    while s.wait_idle(WAIT) && s.has_more() {
        let last = s.view().len().saturating_sub(1);
        if !s.on_visible(last) {
            break;
        }
    }

    assert!(s.last_error().is_none());
    assert!(!s.has_more());
    assert_eq!(s.view().len(), 3);
    assert_eq!(s.pages_loaded(), 2);
    let groups = s.available_groups();
    assert!(groups.contains(&"trips".to_string()));
    assert!(s.view().iter().all(|post| post.url.starts_with(&base)));
}
