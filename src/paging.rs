//! Page-token pagination over a single-page call.

use std::collections::VecDeque;

use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use serde_json::Value;

use crate::{ApiCallFn, Result};

/// Field names of a paginated method.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageDescriptor {
    pub request_page_token_field: String,
    pub response_page_token_field: String,
    /// Repeated response field holding the page's resources.
    pub resource_field: String,
    /// Request field bounding the page size, if the method has one.
    pub request_page_size_field: Option<String>,
}

impl PageDescriptor {
    pub fn new(
        request_page_token_field: impl Into<String>,
        response_page_token_field: impl Into<String>,
        resource_field: impl Into<String>,
    ) -> Self {
        Self {
            request_page_token_field: request_page_token_field.into(),
            response_page_token_field: response_page_token_field.into(),
            resource_field: resource_field.into(),
            request_page_size_field: None,
        }
    }

    pub fn with_request_page_size_field(mut self, field: impl Into<String>) -> Self {
        self.request_page_size_field = Some(field.into());
        self
    }
}

/// One page of results.
#[derive(Clone, Debug, PartialEq)]
pub struct Page {
    pub resources: Vec<Value>,
    /// Request for the following page; `None` on the last page.
    pub next_page_request: Option<Value>,
    pub raw_response: Value,
}

/// Flattens pages returned by a single-page call.
#[derive(Clone)]
pub struct PagedCaller {
    api_call: ApiCallFn,
    descriptor: PageDescriptor,
}

impl PagedCaller {
    pub fn new(api_call: ApiCallFn, descriptor: PageDescriptor) -> Self {
        Self {
            api_call,
            descriptor,
        }
    }

    /// Fetches the single page `request` asks for.
    pub async fn page(&self, request: Value, max_results: Option<usize>) -> Result<Page> {
        let request = self.first_request(request, max_results);
        fetch_page(&self.api_call, &self.descriptor, request).await
    }

    /// Collects resources of every page, stopping after `max_results`.
    pub async fn collect_all(&self, request: Value, max_results: Option<usize>) -> Result<Vec<Value>> {
        self.resources(request, max_results).try_collect().await
    }

    /// Lazily yields resources, fetching pages on demand.
    ///
    /// The stream ends after the last page, after `max_results` resources or
    /// after the first error. Iterating again means calling this again.
    pub fn resources(&self, request: Value, max_results: Option<usize>) -> BoxStream<'static, Result<Value>> {
        let cursor = Cursor {
            api_call: self.api_call.clone(),
            descriptor: self.descriptor.clone(),
            next_request: Some(self.first_request(request, max_results)),
            buffered: VecDeque::new(),
            remaining: max_results,
        };
        stream::unfold(cursor, |mut cursor| async move {
            loop {
                if cursor.remaining == Some(0) {
                    return None;
                }
                if let Some(resource) = cursor.buffered.pop_front() {
                    if let Some(remaining) = cursor.remaining.as_mut() {
                        *remaining -= 1;
                    }
                    return Some((Ok(resource), cursor));
                }
                let request = cursor.next_request.take()?;
                match fetch_page(&cursor.api_call, &cursor.descriptor, request).await {
                    Ok(page) => {
                        cursor.buffered = page.resources.into();
                        cursor.next_request = page.next_page_request;
                    }
                    Err(err) => return Some((Err(err), cursor)),
                }
            }
        })
        .boxed()
    }

    /// Fills in the page size from `max_results` when the request leaves it out.
    fn first_request(&self, mut request: Value, max_results: Option<usize>) -> Value {
        if let (Some(field), Some(max_results)) = (&self.descriptor.request_page_size_field, max_results) {
            if let Some(object) = request.as_object_mut() {
                object
                    .entry(field.clone())
                    .or_insert_with(|| Value::from(max_results));
            }
        }
        request
    }
}

struct Cursor {
    api_call: ApiCallFn,
    descriptor: PageDescriptor,
    next_request: Option<Value>,
    buffered: VecDeque<Value>,
    remaining: Option<usize>,
}

async fn fetch_page(api_call: &ApiCallFn, descriptor: &PageDescriptor, request: Value) -> Result<Page> {
    let response = api_call(request.clone()).await?;
    let resources = match response.get(&descriptor.resource_field) {
        Some(Value::Array(resources)) => resources.clone(),
        _ => Vec::new(),
    };
    let next_page_request = response
        .get(&descriptor.response_page_token_field)
        .and_then(Value::as_str)
        .filter(|token| !token.is_empty())
        .map(|token| {
            let mut next = request;
            if let Some(object) = next.as_object_mut() {
                object.insert(
                    descriptor.request_page_token_field.clone(),
                    Value::from(token),
                );
            }
            next
        });
    Ok(Page {
        resources,
        next_page_request,
        raw_response: response,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::future::{self, FutureExt};
    use futures::StreamExt;
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    use super::{PageDescriptor, PagedCaller};
    use crate::{ApiCallFn, Code, GaxError};

    /// Three pages: [1, 2] -> "a" -> [3, 4] -> "b" -> [5].
    fn pager(requests: Arc<Mutex<Vec<Value>>>) -> ApiCallFn {
        Arc::new(move |request: Value| {
            requests.lock().push(request.clone());
            let response = match request["pageToken"].as_str().unwrap_or("") {
                "" => Ok(json!({"items": [1, 2], "nextPageToken": "a"})),
                "a" => Ok(json!({"items": [3, 4], "nextPageToken": "b"})),
                "b" => Ok(json!({"items": [5], "nextPageToken": ""})),
                other => Err(GaxError::new(Code::InvalidArgument, format!("bad token {other}"))),
            };
            future::ready(response).boxed()
        })
    }

    fn descriptor() -> PageDescriptor {
        PageDescriptor::new("pageToken", "nextPageToken", "items")
    }

    #[tokio::test]
    async fn collects_every_page() {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let caller = PagedCaller::new(pager(Arc::clone(&requests)), descriptor());
        let all = caller.collect_all(json!({"parent": "p"}), None).await.expect("pages");
        assert_eq!(all, vec![json!(1), json!(2), json!(3), json!(4), json!(5)]);
        assert_eq!(requests.lock().len(), 3);
        assert_eq!(requests.lock()[2], json!({"parent": "p", "pageToken": "b"}));
    }

    #[tokio::test]
    async fn stops_fetching_at_max_results() {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let caller = PagedCaller::new(pager(Arc::clone(&requests)), descriptor());
        let some = caller.collect_all(json!({}), Some(3)).await.expect("pages");
        assert_eq!(some, vec![json!(1), json!(2), json!(3)]);
        assert_eq!(requests.lock().len(), 2);
    }

    #[tokio::test]
    async fn single_page_carries_next_request() {
        let caller = PagedCaller::new(pager(Arc::new(Mutex::new(Vec::new()))), descriptor());
        let page = caller.page(json!({"parent": "p"}), None).await.expect("page");
        assert_eq!(page.resources, vec![json!(1), json!(2)]);
        assert_eq!(
            page.next_page_request,
            Some(json!({"parent": "p", "pageToken": "a"}))
        );
        assert_eq!(page.raw_response["nextPageToken"], "a");

        let last = caller
            .page(json!({"pageToken": "b"}), None)
            .await
            .expect("page");
        assert_eq!(last.next_page_request, None);
    }

    #[tokio::test]
    async fn page_size_defaults_to_max_results() {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let caller = PagedCaller::new(
            pager(Arc::clone(&requests)),
            descriptor().with_request_page_size_field("pageSize"),
        );
        caller.page(json!({}), Some(2)).await.expect("page");
        caller.page(json!({"pageSize": 9}), Some(2)).await.expect("page");
        let requests = requests.lock();
        assert_eq!(requests[0]["pageSize"], 2);
        assert_eq!(requests[1]["pageSize"], 9);
    }

    #[tokio::test]
    async fn stream_ends_after_error() {
        let caller = PagedCaller::new(pager(Arc::new(Mutex::new(Vec::new()))), descriptor());
        let items: Vec<_> = caller
            .resources(json!({"pageToken": "zzz"}), None)
            .collect()
            .await;
        assert_eq!(items.len(), 1);
        assert_eq!(
            items[0].as_ref().expect_err("bad token").code,
            Code::InvalidArgument
        );
    }
}
