use crate::engine::Core;
use crate::entity::{Entity, Target, Watermark};
use crate::error::EngineError;
use crate::remote::HistoryQuery;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PageStatus {
    /// The newest message seen reached the remote's latest marker.
    Done,
    More,
    /// No latest marker but more pages: the remote state is unknown.
    Indeterminate,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PageOutcome {
    pub(crate) latest: Watermark,
    pub(crate) status: PageStatus,
}

impl Core {
    pub(crate) async fn fetch_page(
        &self,
        target: &Target,
        query: &HistoryQuery,
        new_section: bool,
    ) -> Result<PageOutcome, EngineError> {
        let (kind, room) = self.room_of(target)?;
        let page = self.api.history(kind, &room, query).await?;
        tracing::debug!(
            entity = %target.qualified_name(),
            messages = page.messages.len(),
            latest = %page.latest,
            has_more = page.has_more,
            "history page"
        );

        let mut latest = Watermark::default();
        let mut first = true;
        for mut message in page.messages.into_iter().rev() {
            if message.room.is_empty() {
                message.room = room.clone();
            }
            let ts = message.ts.clone();
            self.handle_message(message, new_section && first, false, false)
                .await;
            first = false;
            latest.raise_to(&ts);
        }

        let status = if page.latest.is_empty() && page.has_more {
            PageStatus::Indeterminate
        } else if latest == page.latest || latest.value() >= page.latest.value() {
            PageStatus::Done
        } else {
            PageStatus::More
        };
        Ok(PageOutcome { latest, status })
    }

    /// Pages forward from the last-read position until caught up, then
    /// queues a mark. Returns whether the backlog was fully fetched.
    pub(crate) async fn backfill_unread(&self, target: &Target) -> Result<bool, EngineError> {
        let target = self.cache.lookup(&target.key());
        let state = target.read_state().clone();
        if !state.has_backlog() {
            return Ok(false);
        }

        let mut query = HistoryQuery::since(state.last_read.clone());
        let mut first = true;
        loop {
            let page = match self.fetch_page(&target, &query, first).await {
                Ok(page) => page,
                Err(error) => {
                    self.out.warn(&error.to_string());
                    return Err(error);
                }
            };
            first = false;
            match page.status {
                PageStatus::Done => break,
                PageStatus::Indeterminate => {
                    tracing::debug!(entity = %target.qualified_name(), "history state unknown, not marking");
                    return Ok(false);
                }
                PageStatus::More if !page.latest.is_after(&query.oldest) => {
                    tracing::debug!(entity = %target.qualified_name(), "history made no progress");
                    return Ok(false);
                }
                PageStatus::More => query.oldest = page.latest,
            }
        }

        self.enqueue_mark(target.key()).await;
        Ok(true)
    }

    /// Renders the last `count` messages and, when that reaches the
    /// newest one, marks the entity read up to it.
    pub(crate) async fn recent_history(&self, target: &Target, count: u32) -> Result<bool, EngineError> {
        let page = match self.fetch_page(target, &HistoryQuery::last(count), true).await {
            Ok(page) => page,
            Err(error) => {
                self.out.warn(&error.to_string());
                return Err(error);
            }
        };
        if page.status != PageStatus::Done {
            return Ok(false);
        }

        let key = target.key();
        self.cache
            .mutate_read_state(&key, |state| {
                state.latest.raise_to(&page.latest);
            });
        self.enqueue_mark(key).await;
        Ok(true)
    }
}
