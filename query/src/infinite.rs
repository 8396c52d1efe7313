//! Paginated queries.
//!
//! An infinite query caches [`InfiniteData`]: the pages fetched so far and
//! the parameter each page was fetched with. [`InfiniteQueryBehavior`] plugs
//! into a plain [`Query`](crate::Query) and decides which pages a fetch loads.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};

use crate::client::QueryClient;
use crate::error::QueryError;
use crate::key::QueryKey;
use crate::observer::{QueryObserver, QueryObserverResult};
use crate::options::{
  FetchDirection, FetchMore, FetchOptions, QueryConfig, QueryData, QueryFunctionContext, QueryObserverOptions,
  QueryOptions, RefetchOptions,
};
use crate::query::{FetchContext, FetchFn, QueryBehavior};
use crate::subscribable::ListenerId;

/// The cached value of an infinite query.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct InfiniteData<P, TP> {
  pub pages: Vec<P>,
  pub page_params: Vec<TP>,
}

impl<P, TP> Default for InfiniteData<P, TP> {
  fn default() -> Self {
    Self {
      pages: Vec::new(),
      page_params: Vec::new(),
    }
  }
}

pub type PageFn<P, TP> =
  Arc<dyn Fn(QueryFunctionContext<TP>) -> BoxFuture<'static, Result<P, QueryError>> + Send + Sync>;

/// Computes the parameter of an adjacent page from the page at the edge,
/// all pages, the edge page's parameter and all parameters. `None` means
/// there is no such page.
pub type PageParamFn<P, TP> = Arc<dyn Fn(&P, &[P], &TP, &[TP]) -> Option<TP> + Send + Sync>;

/// Fetches pages instead of a single value.
pub struct InfiniteQueryBehavior<P, TP> {
  page_fn: Option<PageFn<P, TP>>,
  initial_page_param: TP,
  get_next_page_param: Option<PageParamFn<P, TP>>,
  get_previous_page_param: Option<PageParamFn<P, TP>>,
}

impl<P, TP: Clone> Clone for InfiniteQueryBehavior<P, TP> {
  fn clone(&self) -> Self {
    Self {
      page_fn: self.page_fn.clone(),
      initial_page_param: self.initial_page_param.clone(),
      get_next_page_param: self.get_next_page_param.clone(),
      get_previous_page_param: self.get_previous_page_param.clone(),
    }
  }
}

impl<P: QueryData + Clone, TP: QueryData + Clone> InfiniteQueryBehavior<P, TP> {
  /// The parameter of the page after the last one.
  pub fn next_page_param(&self, data: &InfiniteData<P, TP>) -> Option<TP> {
    let get_next = self.get_next_page_param.as_ref()?;
    let (page, param) = (data.pages.last()?, data.page_params.last()?);
    get_next(page, &data.pages, param, &data.page_params)
  }

  /// The parameter of the page before the first one.
  pub fn previous_page_param(&self, data: &InfiniteData<P, TP>) -> Option<TP> {
    let get_previous = self.get_previous_page_param.as_ref()?;
    let (page, param) = (data.pages.first()?, data.page_params.first()?);
    get_previous(page, &data.pages, param, &data.page_params)
  }

  async fn fetch_page(
    &self,
    context: &QueryFunctionContext,
    param: TP,
    direction: FetchDirection,
  ) -> Result<P, QueryError> {
    let Some(page_fn) = &self.page_fn else {
      return Err(QueryError::MissingQueryFn(context.query_key.hash_key()));
    };
    page_fn(context.with_page(param, Some(direction))).await
  }

  async fn fetch(&self, context: &FetchContext<InfiniteData<P, TP>>) -> Result<InfiniteData<P, TP>, QueryError> {
    let old = context
      .data
      .as_deref()
      .cloned()
      .unwrap_or_default();

    if old.pages.is_empty() {
      let param = self.initial_page_param.clone();
      let page = self
        .fetch_page(&context.context, param.clone(), FetchDirection::Forward)
        .await?;
      return Ok(InfiniteData {
        pages: vec![page],
        page_params: vec![param],
      });
    }

    if let Some(more) = &context.fetch_more {
      let explicit = more
        .page_param
        .as_ref()
        .and_then(|param| param.downcast_ref::<TP>().cloned());
      return match more.direction {
        FetchDirection::Forward => {
          let Some(param) = explicit.or_else(|| self.next_page_param(&old)) else {
            return Ok(old);
          };
          let page = self
            .fetch_page(&context.context, param.clone(), FetchDirection::Forward)
            .await?;
          let mut next = old;
          next.pages.push(page);
          next.page_params.push(param);
          Ok(next)
        }
        FetchDirection::Backward => {
          let Some(param) = explicit.or_else(|| self.previous_page_param(&old)) else {
            return Ok(old);
          };
          let page = self
            .fetch_page(&context.context, param.clone(), FetchDirection::Backward)
            .await?;
          let mut next = old;
          next.pages.insert(0, page);
          next.page_params.insert(0, param);
          Ok(next)
        }
      };
    }

    // Refetch every stored page in order, deriving each parameter from the
    // pages fetched so far.
    let mut refetched = InfiniteData::default();
    let mut param = old
      .page_params
      .first()
      .cloned()
      .unwrap_or_else(|| self.initial_page_param.clone());
    for index in 0..old.pages.len() {
      let page = self
        .fetch_page(&context.context, param.clone(), FetchDirection::Forward)
        .await?;
      refetched.pages.push(page);
      refetched.page_params.push(param);
      if index + 1 == old.pages.len() {
        break;
      }
      match self.next_page_param(&refetched) {
        Some(next) => param = next,
        None => break,
      }
    }
    tracing::trace!(pages = refetched.pages.len(), "infinite query refetched");
    Ok(refetched)
  }
}

impl<P: QueryData + Clone, TP: QueryData + Clone> QueryBehavior<InfiniteData<P, TP>> for InfiniteQueryBehavior<P, TP> {
  fn on_fetch(&self, context: FetchContext<InfiniteData<P, TP>>) -> FetchFn<InfiniteData<P, TP>> {
    let behavior = self.clone();
    let context = Arc::new(context);
    Arc::new(move || {
      let behavior = behavior.clone();
      let context = context.clone();
      async move { behavior.fetch(&context).await }.boxed()
    })
  }
}

/// Options for an infinite query.
pub struct InfiniteQueryOptions<P, TP> {
  query: QueryOptions<InfiniteData<P, TP>>,
  behavior: InfiniteQueryBehavior<P, TP>,
}

impl<P, TP: Clone> Clone for InfiniteQueryOptions<P, TP> {
  fn clone(&self) -> Self {
    Self {
      query: self.query.clone(),
      behavior: self.behavior.clone(),
    }
  }
}

impl<P, TP> fmt::Debug for InfiniteQueryOptions<P, TP> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("InfiniteQueryOptions")
      .field("query", &self.query)
      .field("has_page_fn", &self.behavior.page_fn.is_some())
      .finish_non_exhaustive()
  }
}

impl<P: QueryData + Clone, TP: QueryData + Clone> InfiniteQueryOptions<P, TP> {
  pub fn new(query_key: impl Into<QueryKey>, initial_page_param: TP) -> Self {
    Self {
      query: QueryOptions::new(query_key),
      behavior: InfiniteQueryBehavior {
        page_fn: None,
        initial_page_param,
        get_next_page_param: None,
        get_previous_page_param: None,
      },
    }
  }

  /// The function fetching one page. The context carries the page parameter
  /// and the direction.
  pub fn query_fn<F, Fut>(mut self, f: F) -> Self
  where
    F: Fn(QueryFunctionContext<TP>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<P, QueryError>> + Send + 'static,
  {
    self.behavior.page_fn = Some(Arc::new(move |context| f(context).boxed()));
    self
  }

  pub fn get_next_page_param(mut self, f: impl Fn(&P, &[P], &TP, &[TP]) -> Option<TP> + Send + Sync + 'static) -> Self {
    self.behavior.get_next_page_param = Some(Arc::new(f));
    self
  }

  pub fn get_previous_page_param(
    mut self,
    f: impl Fn(&P, &[P], &TP, &[TP]) -> Option<TP> + Send + Sync + 'static,
  ) -> Self {
    self.behavior.get_previous_page_param = Some(Arc::new(f));
    self
  }

  pub fn with_config(mut self, config: &QueryConfig) -> Self {
    self.query = self.query.with_config(config);
    self
  }

  /// Adjusts the underlying query options (stale time, retry, ...).
  pub fn map_query(
    mut self,
    f: impl FnOnce(QueryOptions<InfiniteData<P, TP>>) -> QueryOptions<InfiniteData<P, TP>>,
  ) -> Self {
    self.query = f(self.query);
    self
  }

  pub fn behavior(&self) -> &InfiniteQueryBehavior<P, TP> {
    &self.behavior
  }

  pub fn into_query_options(self) -> QueryOptions<InfiniteData<P, TP>> {
    self.query.behavior(Arc::new(self.behavior))
  }
}

impl<P: QueryData + Clone, TP: QueryData + Clone> From<InfiniteQueryOptions<P, TP>> for QueryOptions<InfiniteData<P, TP>> {
  fn from(options: InfiniteQueryOptions<P, TP>) -> Self {
    options.into_query_options()
  }
}

impl<P: QueryData + Clone, TP: QueryData + Clone> From<InfiniteQueryOptions<P, TP>>
  for QueryObserverOptions<InfiniteData<P, TP>>
{
  fn from(options: InfiniteQueryOptions<P, TP>) -> Self {
    QueryObserverOptions::from(options.into_query_options())
  }
}

/// Per-call switches for `fetch_next_page` / `fetch_previous_page`.
#[derive(Debug, Clone)]
pub struct FetchPageOptions<TP> {
  pub cancel_refetch: bool,
  pub throw_on_error: bool,
  /// Fetch this page instead of the computed one.
  pub page_param: Option<TP>,
}

impl<TP> Default for FetchPageOptions<TP> {
  fn default() -> Self {
    Self {
      cancel_refetch: true,
      throw_on_error: false,
      page_param: None,
    }
  }
}

/// An observer result plus the paging flags.
pub struct InfiniteQueryResult<P, TP> {
  pub result: QueryObserverResult<InfiniteData<P, TP>>,
  pub has_next_page: bool,
  pub has_previous_page: bool,
  pub is_fetching_next_page: bool,
  pub is_fetching_previous_page: bool,
}

impl<P, TP> Clone for InfiniteQueryResult<P, TP> {
  fn clone(&self) -> Self {
    Self {
      result: self.result.clone(),
      has_next_page: self.has_next_page,
      has_previous_page: self.has_previous_page,
      is_fetching_next_page: self.is_fetching_next_page,
      is_fetching_previous_page: self.is_fetching_previous_page,
    }
  }
}

impl<P: fmt::Debug, TP: fmt::Debug> fmt::Debug for InfiniteQueryResult<P, TP> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("InfiniteQueryResult")
      .field("result", &self.result)
      .field("has_next_page", &self.has_next_page)
      .field("has_previous_page", &self.has_previous_page)
      .field("is_fetching_next_page", &self.is_fetching_next_page)
      .field("is_fetching_previous_page", &self.is_fetching_previous_page)
      .finish()
  }
}

impl<P, TP> std::ops::Deref for InfiniteQueryResult<P, TP> {
  type Target = QueryObserverResult<InfiniteData<P, TP>>;

  fn deref(&self) -> &Self::Target {
    &self.result
  }
}

/// A [`QueryObserver`] over an infinite query, with page navigation.
pub struct InfiniteQueryObserver<P: QueryData + Clone, TP: QueryData + Clone> {
  observer: QueryObserver<InfiniteData<P, TP>>,
  behavior: Arc<parking_lot::Mutex<InfiniteQueryBehavior<P, TP>>>,
}

impl<P: QueryData + Clone, TP: QueryData + Clone> InfiniteQueryObserver<P, TP> {
  pub fn new(client: &QueryClient, options: InfiniteQueryOptions<P, TP>) -> Result<Self, QueryError> {
    let behavior = options.behavior.clone();
    let observer = QueryObserver::new(client, options)?;
    Ok(Self {
      observer,
      behavior: Arc::new(parking_lot::Mutex::new(behavior)),
    })
  }

  pub fn set_options(&self, options: InfiniteQueryOptions<P, TP>) -> Result<(), QueryError> {
    *self.behavior.lock() = options.behavior.clone();
    self.observer.set_options(options)
  }

  pub fn subscribe(&self, listener: impl Fn(&InfiniteQueryResult<P, TP>) + Send + Sync + 'static) -> ListenerId {
    let behavior = self.behavior.clone();
    let query = self.observer.query_resolver();
    self.observer.subscribe(move |result| {
      let direction = query()
        .and_then(|query| query.state().fetch_meta)
        .and_then(|meta| meta.direction);
      let behavior = behavior.lock().clone();
      listener(&paged(&behavior, result.clone(), direction));
    })
  }

  pub fn unsubscribe(&self, id: ListenerId) {
    self.observer.unsubscribe(id);
  }

  pub fn destroy(&self) {
    self.observer.destroy();
  }

  pub fn current_result(&self) -> InfiniteQueryResult<P, TP> {
    let direction = self
      .observer
      .current_query()
      .state()
      .fetch_meta
      .and_then(|meta| meta.direction);
    let behavior = self.behavior.lock().clone();
    paged(&behavior, self.observer.current_result(), direction)
  }

  pub fn observer(&self) -> &QueryObserver<InfiniteData<P, TP>> {
    &self.observer
  }

  pub fn refetch(
    &self,
    options: RefetchOptions,
  ) -> BoxFuture<'static, Result<QueryObserverResult<InfiniteData<P, TP>>, QueryError>> {
    self.observer.refetch(options)
  }

  pub fn fetch_next_page(
    &self,
    options: FetchPageOptions<TP>,
  ) -> BoxFuture<'static, Result<QueryObserverResult<InfiniteData<P, TP>>, QueryError>> {
    self.fetch_page(FetchDirection::Forward, options)
  }

  pub fn fetch_previous_page(
    &self,
    options: FetchPageOptions<TP>,
  ) -> BoxFuture<'static, Result<QueryObserverResult<InfiniteData<P, TP>>, QueryError>> {
    self.fetch_page(FetchDirection::Backward, options)
  }

  fn fetch_page(
    &self,
    direction: FetchDirection,
    options: FetchPageOptions<TP>,
  ) -> BoxFuture<'static, Result<QueryObserverResult<InfiniteData<P, TP>>, QueryError>> {
    let fetch_options = FetchOptions {
      cancel_refetch: options.cancel_refetch,
      fetch_more: Some(FetchMore {
        direction,
        page_param: options
          .page_param
          .map(|param| Arc::new(param) as Arc<dyn Any + Send + Sync>),
      }),
    };
    self.observer.fetch(fetch_options, options.throw_on_error)
  }

  pub fn has_next_page(&self) -> bool {
    self.current_result().has_next_page
  }

  pub fn has_previous_page(&self) -> bool {
    self.current_result().has_previous_page
  }

  pub fn is_fetching_next_page(&self) -> bool {
    self.current_result().is_fetching_next_page
  }

  pub fn is_fetching_previous_page(&self) -> bool {
    self.current_result().is_fetching_previous_page
  }
}

impl<P: QueryData + Clone, TP: QueryData + Clone> fmt::Debug for InfiniteQueryObserver<P, TP> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("InfiniteQueryObserver")
      .field("observer", &self.observer)
      .finish()
  }
}

fn paged<P: QueryData + Clone, TP: QueryData + Clone>(
  behavior: &InfiniteQueryBehavior<P, TP>,
  result: QueryObserverResult<InfiniteData<P, TP>>,
  direction: Option<FetchDirection>,
) -> InfiniteQueryResult<P, TP> {
  let (has_next_page, has_previous_page) = match result.data.as_deref() {
    Some(data) => (
      behavior.next_page_param(data).is_some(),
      behavior.previous_page_param(data).is_some(),
    ),
    None => (false, false),
  };
  let fetching = result.is_fetching();
  InfiniteQueryResult {
    has_next_page,
    has_previous_page,
    is_fetching_next_page: fetching && direction == Some(FetchDirection::Forward),
    is_fetching_previous_page: fetching && direction == Some(FetchDirection::Backward),
    result,
  }
}
