use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// Query keys consumed by [`PageOptions`]; everything else is a filter.
pub const PAGINATION_KEYS: &[&str] = &["page", "take", "skip", "order", "search"];

pub const DEFAULT_PAGE: i64 = 1;
pub const DEFAULT_TAKE: i64 = 10;
pub const MAX_TAKE: i64 = 50;
/// Highest page number whose offset still fits in an `i64` at [`MAX_TAKE`].
pub const MAX_PAGE: i64 = i64::MAX / MAX_TAKE;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "ASC" => Some(Self::Asc),
            "DESC" => Some(Self::Desc),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageOptions {
    pub page: i64,
    pub take: i64,
    pub order: SortOrder,
    pub search: Option<String>,
}

impl Default for PageOptions {
    fn default() -> Self {
        Self {
            page: DEFAULT_PAGE,
            take: DEFAULT_TAKE,
            order: SortOrder::Asc,
            search: None,
        }
    }
}

impl PageOptions {
    pub fn from_query(query: &HashMap<String, String>) -> AppResult<Self> {
        let page = match query.get("page").map(|value| value.trim()) {
            Some(value) if !value.is_empty() => value
                .parse::<i64>()
                .map_err(|_| AppError::bad_request("page must be an integer"))?,
            _ => DEFAULT_PAGE,
        };
        if !(1..=MAX_PAGE).contains(&page) {
            return Err(AppError::bad_request(format!(
                "page must be between 1 and {MAX_PAGE}"
            )));
        }

        let take = match query.get("take").map(|value| value.trim()) {
            Some(value) if !value.is_empty() => value
                .parse::<i64>()
                .map_err(|_| AppError::bad_request("take must be an integer"))?,
            _ => DEFAULT_TAKE,
        };
        if !(1..=MAX_TAKE).contains(&take) {
            return Err(AppError::bad_request(format!(
                "take must be between 1 and {MAX_TAKE}"
            )));
        }

        let order = match query.get("order").map(|value| value.trim()) {
            Some(value) if !value.is_empty() => SortOrder::parse(value)
                .ok_or_else(|| AppError::bad_request("order must be ASC or DESC"))?,
            _ => SortOrder::default(),
        };

        let search = query
            .get("search")
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(|value| value.to_owned());

        Ok(Self {
            page,
            take,
            order,
            search,
        })
    }

    pub fn skip(&self) -> i64 {
        (self.page - 1).max(0).saturating_mul(self.take)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMeta {
    pub page: i64,
    pub take: i64,
    pub item_count: i64,
    pub page_count: i64,
    pub has_previous_page: bool,
    pub has_next_page: bool,
}

impl PageMeta {
    pub fn new(options: &PageOptions, item_count: i64) -> Self {
        let page_count = if item_count == 0 {
            0
        } else {
            (item_count + options.take - 1) / options.take
        };
        Self {
            page: options.page,
            take: options.take,
            item_count,
            page_count,
            has_previous_page: options.page > 1,
            has_next_page: options.page < page_count,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub meta: PageMeta,
}

#[derive(Debug, Serialize)]
pub struct Item<T> {
    pub data: T,
}
