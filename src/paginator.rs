use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Result;
use crate::media;
use crate::model::{Cursor, Post};

/// A remote listing that hands out pages behind an opaque cursor.
pub trait PageSource: Send + Sync {
    fn fetch_page(&self, cursor: Option<&str>) -> Result<Page>;

    fn describe(&self) -> String;
}

#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<Post>,
    pub next_cursor: Option<Cursor>,
    /// Children the provider returned before any displayability filtering.
    pub raw_count: usize,
}

impl Page {
    pub fn new(records: Vec<Post>, next_cursor: Option<Cursor>) -> Self {
        let raw_count = records.len();
        Self {
            records,
            next_cursor,
            raw_count,
        }
    }
}

/// Append-only record of everything fetched this session.
#[derive(Debug, Default, Clone)]
pub struct SourceList {
    records: Vec<Arc<Post>>,
    ids: HashSet<String>,
}

impl SourceList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[Arc<Post>] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Post>> {
        if !self.ids.contains(id) {
            return None;
        }
        self.records.iter().find(|post| post.id == id)
    }

    /// Appends records not already present. Returns how many were added.
    pub fn append(&mut self, batch: Vec<Post>) -> usize {
        let mut added = 0;
        for post in batch {
            if self.ids.insert(post.id.clone()) {
                self.records.push(Arc::new(post));
                added += 1;
            }
        }
        added
    }

    fn clear(&mut self) {
        self.records.clear();
        self.ids.clear();
    }
}

/// Permission to run exactly one fetch, stamped with the session generation
/// it was issued under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    generation: u64,
    cursor: Option<Cursor>,
}

impl FetchTicket {
    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Appended { added: usize, exhausted: bool },
    /// The ticket predates the last reset; nothing was applied.
    Discarded,
}

#[derive(Debug, Default)]
pub struct Paginator {
    cursor: Option<Cursor>,
    exhausted: bool,
    in_flight: bool,
    generation: u64,
    pages: usize,
}

impl Paginator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_more(&self) -> bool {
        !self.exhausted
    }

    pub fn is_pending(&self) -> bool {
        self.in_flight
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn pages_loaded(&self) -> usize {
        self.pages
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Hands out a ticket unless a fetch is already running or the source is
    /// exhausted.
    pub fn begin(&mut self) -> Option<FetchTicket> {
        if self.in_flight || self.exhausted {
            return None;
        }
        self.in_flight = true;
        Some(FetchTicket {
            generation: self.generation,
            cursor: self.cursor.clone(),
        })
    }

    /// Applies the outcome of a ticket's fetch.
    ///
    /// On failure the cursor and exhaustion flag are left alone so the same
    /// page can be requested again.
    pub fn complete(
        &mut self,
        ticket: FetchTicket,
        result: Result<Page>,
        list: &mut SourceList,
    ) -> Result<Completion> {
        if ticket.generation != self.generation {
            debug!(
                ticket = ticket.generation,
                current = self.generation,
                "discarding stale page"
            );
            return Ok(Completion::Discarded);
        }
        self.in_flight = false;

        let page = match result {
            Ok(page) => page,
            Err(err) => {
                warn!(cursor = ?ticket.cursor, "page fetch failed: {err}");
                return Err(err);
            }
        };

        let raw_count = page.raw_count.max(page.records.len());
        let displayable: Vec<Post> = page
            .records
            .into_iter()
            .filter(media::is_displayable)
            .collect();
        let added = list.append(displayable);

        self.pages += 1;
        self.exhausted = page.next_cursor.is_none() || raw_count == 0;
        self.cursor = page.next_cursor;
        debug!(
            added,
            raw_count,
            exhausted = self.exhausted,
            cursor = ?self.cursor,
            "page applied"
        );

        Ok(Completion::Appended {
            added,
            exhausted: self.exhausted,
        })
    }

    /// Convenience for callers without their own worker: fetch and apply in
    /// one blocking step. Returns `None` if no fetch was allowed.
    pub fn fetch_next(
        &mut self,
        source: &dyn PageSource,
        list: &mut SourceList,
    ) -> Option<Result<Completion>> {
        let ticket = self.begin()?;
        let result = source.fetch_page(ticket.cursor());
        Some(self.complete(ticket, result, list))
    }

    /// Forgets the cursor, the records and any in-flight ticket.
    pub fn reset(&mut self, list: &mut SourceList) {
        self.generation += 1;
        self.cursor = None;
        self.exhausted = false;
        self.in_flight = false;
        self.pages = 0;
        list.clear();
    }
}
