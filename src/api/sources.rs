//! Paginated endpoints exposed as [`PageSource`]s.

use color_eyre::eyre::eyre;
use futures::future::BoxFuture;
use futures::FutureExt;

use super::client::ConsoleClient;
use super::types::{ItemFilters, ItemRecord, JobFilters, JobRecord};
use crate::error::SyncResult;
use crate::pagination::{Cursor, Page, PageSource};

/// Jobs, paged by the server's own cursor.
pub struct JobsSource {
  client: ConsoleClient,
}

impl JobsSource {
  pub fn new(client: ConsoleClient) -> Self {
    Self { client }
  }
}

impl PageSource for JobsSource {
  type Item = JobRecord;
  type Filters = JobFilters;

  fn name(&self) -> &'static str {
    "jobs"
  }

  fn fetch_page(
    &self,
    filters: &JobFilters,
    cursor: Option<&Cursor>,
    limit: usize,
  ) -> BoxFuture<'static, SyncResult<Page<JobRecord>>> {
    let client = self.client.clone();
    let filters = filters.clone();
    let cursor = cursor.cloned();
    async move {
      let response = client
        .get_jobs(&filters, limit, cursor.as_ref().map(Cursor::as_str))
        .await?;
      let has_more = response.has_more;
      let next_cursor = response.next_cursor.clone().map(Cursor);
      Ok(Page {
        items: response.into_records(),
        has_more: has_more && next_cursor.is_some(),
        next_cursor,
      })
    }
    .boxed()
  }
}

/// Items, paged by offset. The offset travels as an opaque cursor.
pub struct ItemsSource {
  client: ConsoleClient,
}

impl ItemsSource {
  pub fn new(client: ConsoleClient) -> Self {
    Self { client }
  }
}

impl PageSource for ItemsSource {
  type Item = ItemRecord;
  type Filters = ItemFilters;

  fn name(&self) -> &'static str {
    "items"
  }

  fn fetch_page(
    &self,
    filters: &ItemFilters,
    cursor: Option<&Cursor>,
    limit: usize,
  ) -> BoxFuture<'static, SyncResult<Page<ItemRecord>>> {
    let client = self.client.clone();
    let filters = filters.clone();
    let cursor = cursor.cloned();
    async move {
      let offset = offset_from(cursor.as_ref())?;
      let response = client.get_items(&filters, limit, offset).await?;
      let next_cursor = response.next_offset.map(offset_cursor);
      Ok(Page {
        items: response.items,
        has_more: next_cursor.is_some(),
        next_cursor,
      })
    }
    .boxed()
  }
}

fn offset_cursor(offset: u64) -> Cursor {
  Cursor(offset.to_string())
}

fn offset_from(cursor: Option<&Cursor>) -> SyncResult<u64> {
  match cursor {
    None => Ok(0),
    Some(cursor) => cursor
      .as_str()
      .parse()
      .map_err(|e| eyre!("Invalid items cursor {:?}: {}", cursor.as_str(), e).into()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_offset_cursor_round_trip() {
    assert_eq!(offset_from(None).unwrap(), 0);
    assert_eq!(offset_from(Some(&offset_cursor(40))).unwrap(), 40);
    assert!(offset_from(Some(&Cursor("abc".to_string()))).is_err());
  }
}
