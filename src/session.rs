//! Session controller: owns the source list and wires pagination, ordering
//! and the visibility trigger together.
//!
//! Fetches run on short-lived worker threads and report back over a channel.
//! Nothing they return is applied until [`Controller::poll`] (or
//! [`Controller::wait_idle`]) runs on the owning thread, so every mutation of
//! session state happens in one place.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info};

use crate::error::Error;
use crate::error::Result;
use crate::media::MediaType;
use crate::model::Post;
use crate::ordering::{self, DateRange, Debounce, DisplayState, FilterCriteria, OrderMode};
use crate::paginator::{Completion, FetchTicket, Page, PageSource, Paginator, SourceList};
use crate::selection::{Collections, Selection};
use crate::storage::KeyValueStore;
use crate::trigger::{TriggerState, VisibilityTrigger};

#[derive(Debug, Clone)]
pub struct Options {
    pub lookahead: usize,
    pub debounce: Duration,
    pub order: OrderMode,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            lookahead: 3,
            debounce: Duration::from_millis(150),
            order: OrderMode::Random,
        }
    }
}

struct Fetched {
    ticket: FetchTicket,
    result: Result<Page>,
}

pub struct Controller {
    source: Arc<dyn PageSource>,
    list: SourceList,
    paginator: Paginator,
    trigger: VisibilityTrigger,
    display: DisplayState,
    debounce: Debounce,
    pending_query: Option<String>,
    view: Vec<Arc<Post>>,
    selection: Selection,
    collections: Collections,
    last_error: Option<Error>,
    tx: Sender<Fetched>,
    rx: Receiver<Fetched>,
}

impl Controller {
    pub fn new(source: Arc<dyn PageSource>, store: Arc<dyn KeyValueStore>, opts: Options) -> Self {
        let (tx, rx) = unbounded();
        Self {
            source,
            list: SourceList::new(),
            paginator: Paginator::new(),
            trigger: VisibilityTrigger::new(opts.lookahead),
            display: DisplayState::new(opts.order),
            debounce: Debounce::new(opts.debounce),
            pending_query: None,
            view: Vec::new(),
            selection: Selection::new(),
            collections: Collections::load(store),
            last_error: None,
            tx,
            rx,
        }
    }

    /// Issues the first page request. Later pages only come from visibility
    /// signals or [`Controller::load_more`].
    pub fn start(&mut self) -> bool {
        info!(source = %self.source.describe(), "session started");
        self.load_more()
    }

    /// Requests the next page outside of a visibility signal, e.g. a manual
    /// retry after a failure.
    pub fn load_more(&mut self) -> bool {
        if !self.trigger.on_fetch_started() {
            return false;
        }
        self.spawn_fetch()
    }

    /// Clears the last error and asks for the failed page again. This is the
    /// only way past an error that blocked the trigger, short of a reset.
    pub fn retry(&mut self) -> bool {
        self.last_error = None;
        self.trigger.unblock();
        self.load_more()
    }

    /// Reports that the item at `index` of the current view became visible.
    /// Returns true if that started a fetch.
    pub fn on_visible(&mut self, index: usize) -> bool {
        // Indices refer to a view that is about to be replaced.
        if self.debounce.is_pending() {
            return false;
        }
        if !self.trigger.on_visible(index, self.view.len()) {
            return false;
        }
        self.spawn_fetch()
    }

    fn spawn_fetch(&mut self) -> bool {
        let Some(ticket) = self.paginator.begin() else {
            // Either exhausted or already in flight; keep the trigger in step.
            if !self.paginator.has_more() {
                self.trigger.on_fetch_complete(false);
            }
            return false;
        };
        debug!(cursor = ?ticket.cursor(), generation = ticket.generation(), "fetching page");
        let source = self.source.clone();
        let tx = self.tx.clone();
        thread::spawn(move || {
            let result = source.fetch_page(ticket.cursor());
            let _ = tx.send(Fetched { ticket, result });
        });
        true
    }

    /// Applies finished fetches and due recomputations. Returns how many
    /// events were applied.
    pub fn poll(&mut self) -> usize {
        self.poll_at(Instant::now())
    }

    pub fn poll_at(&mut self, now: Instant) -> usize {
        let mut applied = 0;
        while let Ok(fetched) = self.rx.try_recv() {
            self.apply(fetched);
            applied += 1;
        }
        if self.debounce.take_due(now).is_some() {
            self.apply_pending_query();
            applied += 1;
        }
        applied
    }

    /// Blocks until no fetch is outstanding or `timeout` passes. Returns
    /// false on timeout.
    pub fn wait_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.paginator.is_pending() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(fetched) => self.apply(fetched),
                Err(RecvTimeoutError::Timeout) => return false,
                Err(RecvTimeoutError::Disconnected) => return false,
            }
        }
        self.poll();
        true
    }

    fn apply(&mut self, fetched: Fetched) {
        match self
            .paginator
            .complete(fetched.ticket, fetched.result, &mut self.list)
        {
            Ok(Completion::Appended { added, exhausted }) => {
                self.trigger.on_fetch_complete(!exhausted);
                self.last_error = None;
                self.recompute();
                debug!(added, total = self.list.len(), shown = self.view.len(), "page appended");
            }
            Ok(Completion::Discarded) => {}
            Err(err) => {
                self.trigger.on_fetch_failed(err.is_retryable());
                self.last_error = Some(err);
            }
        }
    }

    /// Drops everything fetched so far and switches to `source`. Responses
    /// still in flight for the old source are discarded when they arrive.
    pub fn reset(&mut self, source: Arc<dyn PageSource>) {
        info!(from = %self.source.describe(), to = %source.describe(), "session reset");
        self.paginator.reset(&mut self.list);
        self.trigger.reset();
        self.display.reset_layout();
        self.debounce.cancel();
        self.pending_query = None;
        self.selection.clear();
        self.view.clear();
        self.last_error = None;
        self.source = source;
    }

    /// Defers the search recomputation; typing in quick succession only
    /// applies the last query.
    pub fn set_query(&mut self, query: impl Into<String>) {
        self.set_query_at(query, Instant::now());
    }

    pub fn set_query_at(&mut self, query: impl Into<String>, now: Instant) {
        self.pending_query = Some(query.into());
        self.debounce.request(now);
    }

    /// Applies a deferred query immediately.
    pub fn flush(&mut self) {
        if self.debounce.is_pending() {
            self.debounce.cancel();
            self.apply_pending_query();
        }
    }

    fn apply_pending_query(&mut self) {
        if let Some(query) = self.pending_query.take() {
            self.display.criteria_mut().query = query;
        }
        self.recompute();
    }

    pub fn set_media_types(&mut self, types: impl IntoIterator<Item = MediaType>) {
        self.display.criteria_mut().media_types = types.into_iter().collect();
        self.recompute();
    }

    pub fn set_groups<I, S>(&mut self, groups: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.display.criteria_mut().groups = groups.into_iter().map(Into::into).collect();
        self.recompute();
    }

    pub fn set_date_range(&mut self, range: DateRange) {
        self.display.criteria_mut().date_range = range;
        self.recompute();
    }

    pub fn set_criteria(&mut self, criteria: FilterCriteria) {
        self.debounce.cancel();
        self.pending_query = None;
        self.display.set_criteria(criteria);
        self.recompute();
    }

    pub fn set_mode(&mut self, mode: OrderMode) {
        self.display.set_mode(mode);
        self.recompute();
    }

    pub fn toggle_mode(&mut self) -> OrderMode {
        let mode = self.display.toggle_mode();
        self.recompute();
        mode
    }

    /// Draws a new permutation. A no-op outside random mode.
    pub fn reshuffle(&mut self) -> bool {
        if !self.display.reshuffle() {
            return false;
        }
        self.recompute();
        true
    }

    fn recompute(&mut self) {
        self.view = self.display.compute(self.list.records());
    }

    pub fn view(&self) -> &[Arc<Post>] {
        &self.view
    }

    pub fn source_list(&self) -> &SourceList {
        &self.list
    }

    pub fn describe(&self) -> String {
        self.source.describe()
    }

    pub fn criteria(&self) -> &FilterCriteria {
        self.display.criteria()
    }

    pub fn mode(&self) -> OrderMode {
        self.display.mode()
    }

    pub fn available_groups(&self) -> Vec<String> {
        ordering::available_groups(self.list.records())
    }

    pub fn trigger_state(&self) -> TriggerState {
        self.trigger.state()
    }

    pub fn has_more(&self) -> bool {
        self.paginator.has_more()
    }

    pub fn is_loading(&self) -> bool {
        self.paginator.is_pending()
    }

    pub fn pages_loaded(&self) -> usize {
        self.paginator.pages_loaded()
    }

    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn selection_mut(&mut self) -> &mut Selection {
        &mut self.selection
    }

    pub fn collections(&self) -> &Collections {
        &self.collections
    }

    pub fn collections_mut(&mut self) -> &mut Collections {
        &mut self.collections
    }

    /// Adds every selected id to a collection, then clears the selection.
    pub fn add_selection_to(&mut self, collection_id: &str) -> Result<usize> {
        let ids = self.selection.ids();
        let count = ids.len();
        self.collections.add(collection_id, ids)?;
        self.selection.clear();
        Ok(count)
    }
}
