use crate::error::ResilienceError;
use crate::rate_limit::{Admission, RateLimiter};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// A layer that enforces a [`RateLimiter`] on every request.
///
/// `key` maps a request to the `(endpoint, identifier)` pair it is limited
/// under, e.g. the provider endpoint and the API key the request carries.
#[derive(Clone, Debug)]
pub struct RateLimitLayer<K> {
    limiter: RateLimiter,
    key: K,
}

impl<K> RateLimitLayer<K> {
    /// Create a new rate limit layer.
    pub fn new(limiter: RateLimiter, key: K) -> Self {
        Self { limiter, key }
    }
}

impl<S, K> Layer<S> for RateLimitLayer<K>
where
    K: Clone,
{
    type Service = RateLimitService<S, K>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService { inner: service, limiter: self.limiter.clone(), key: self.key.clone() }
    }
}

/// Middleware service that enforces rate limits.
#[derive(Clone, Debug)]
pub struct RateLimitService<S, K> {
    inner: S,
    limiter: RateLimiter,
    key: K,
}

impl<S, K, Req> Service<Req> for RateLimitService<S, K>
where
    S: Service<Req>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    S::Response: Send + 'static,
    K: Fn(&Req) -> (String, String),
{
    type Response = S::Response;
    type Error = ResilienceError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(ResilienceError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let (endpoint, identifier) = (self.key)(&req);
        match self.limiter.check_and_consume(&endpoint, &identifier) {
            Admission::Allowed { .. } => {
                let fut = self.inner.call(req);
                Box::pin(async move { fut.await.map_err(ResilienceError::Inner) })
            }
            Admission::Limited { retry_after_secs, window } => {
                Box::pin(async move { Err(ResilienceError::RateLimited { retry_after_secs, window }) })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rate_limit::{Window, WindowLimits};
    use std::time::Duration;
    use tower::{service_fn, ServiceBuilder, ServiceExt};

    #[derive(Debug, Clone)]
    struct Lookup {
        api_key: &'static str,
        query: &'static str,
    }

    fn lookup_key(req: &Lookup) -> (String, String) {
        ("geocode".to_string(), req.api_key.to_string())
    }

    #[tokio::test]
    async fn denies_once_window_is_exhausted() {
        let clock = ManualClock::new();
        let limiter = RateLimiter::new(WindowLimits::new(1, 10, 100, 1_000).unwrap())
            .with_clock(clock.clone());
        let svc = ServiceBuilder::new()
            .layer(RateLimitLayer::new(limiter, lookup_key))
            .service(service_fn(|req: Lookup| async move {
                Ok::<_, std::io::Error>(format!("resolved {}", req.query))
            }));

        let first = svc.clone().oneshot(Lookup { api_key: "a", query: "san juan" }).await;
        assert_eq!(first.unwrap(), "resolved san juan");

        let second = svc.clone().oneshot(Lookup { api_key: "a", query: "ponce" }).await;
        match second {
            Err(ResilienceError::RateLimited { retry_after_secs, window }) => {
                assert_eq!(retry_after_secs, 1);
                assert_eq!(window, Window::Second);
            }
            other => panic!("expected rate limit, got {other:?}"),
        }

        // other keys are unaffected
        assert!(svc.clone().oneshot(Lookup { api_key: "b", query: "ponce" }).await.is_ok());

        clock.advance(Duration::from_secs(1));
        assert!(svc.oneshot(Lookup { api_key: "a", query: "ponce" }).await.is_ok());
    }

    #[tokio::test]
    async fn inner_errors_pass_through() {
        let limiter = RateLimiter::new(WindowLimits::new(5, 10, 100, 1_000).unwrap());
        let svc = RateLimitLayer::new(limiter, lookup_key).layer(service_fn(|_req: Lookup| async {
            Err::<String, _>(std::io::Error::new(std::io::ErrorKind::Other, "upstream"))
        }));
        let err = svc.oneshot(Lookup { api_key: "a", query: "x" }).await.unwrap_err();
        assert!(!err.is_rate_limited());
        assert_eq!(err.into_inner().unwrap().to_string(), "upstream");
    }
}
