//! Origin mock builder.
//!
//! Wraps mockito to provide cache-flavored response builders: cacheable
//! responses with `Cache-Control: max-age`, uncacheable responses, slow
//! responses for collapse tests, and cookie-conditional bodies for
//! revalidation tests.

use std::time::Duration;

use mockito::{Mock, Server, ServerGuard};

/// Builder for origin responses served by a local mockito server.
pub struct OriginMockBuilder {
    server: ServerGuard,
}

impl OriginMockBuilder {
    /// Starts a fresh mock origin.
    pub async fn new() -> Self {
        Self { server: Server::new_async().await }
    }

    /// Host and port the harness should point its upstream config at.
    #[must_use]
    pub fn host_and_port(&self) -> (String, u16) {
        let host_with_port = self.server.host_with_port();
        let (host, port) = host_with_port
            .rsplit_once(':')
            .expect("mockito address always has a port");
        (host.to_string(), port.parse().expect("valid port"))
    }

    /// Clears all registered mocks.
    pub async fn reset(&mut self) {
        self.server.reset_async().await;
    }

    /// A cacheable GET response with `Cache-Control: max-age`.
    pub async fn mock_cacheable(&mut self, path: &str, body: &str, max_age: u64) -> Mock {
        self.server
            .mock("GET", path)
            .with_status(200)
            .with_header("content-type", "text/plain")
            .with_header("cache-control", &format!("max-age={max_age}"))
            .with_body(body)
            .create_async()
            .await
    }

    /// A cacheable response expected to be fetched exactly `hits` times.
    pub async fn mock_cacheable_expect(
        &mut self,
        path: &str,
        body: &str,
        max_age: u64,
        hits: usize,
    ) -> Mock {
        self.server
            .mock("GET", path)
            .with_status(200)
            .with_header("content-type", "text/plain")
            .with_header("cache-control", &format!("max-age={max_age}"))
            .with_body(body)
            .expect(hits)
            .create_async()
            .await
    }

    /// A response with no caching headers; never stored.
    pub async fn mock_uncacheable(&mut self, path: &str, body: &str) -> Mock {
        self.server
            .mock("GET", path)
            .with_status(200)
            .with_header("content-type", "text/plain")
            .with_body(body)
            .create_async()
            .await
    }

    /// A cacheable response that stalls before writing its body, expected to
    /// be fetched exactly `hits` times. Used to hold a collapse window open.
    pub async fn mock_slow_expect(
        &mut self,
        path: &str,
        body: &str,
        max_age: u64,
        delay: Duration,
        hits: usize,
    ) -> Mock {
        let body = body.as_bytes().to_vec();
        self.server
            .mock("GET", path)
            .with_status(200)
            .with_header("content-type", "text/plain")
            .with_header("cache-control", &format!("max-age={max_age}"))
            .with_chunked_body(move |writer| {
                std::thread::sleep(delay);
                writer.write_all(&body)
            })
            .expect(hits)
            .create_async()
            .await
    }

    /// A cacheable response only matched when the request carries the given
    /// `Cookie` header.
    pub async fn mock_cacheable_with_cookie(
        &mut self,
        path: &str,
        cookie: &str,
        body: &str,
        max_age: u64,
    ) -> Mock {
        self.server
            .mock("GET", path)
            .match_header("cookie", cookie)
            .with_status(200)
            .with_header("content-type", "text/plain")
            .with_header("cache-control", &format!("max-age={max_age}"))
            .with_body(body)
            .create_async()
            .await
    }

    /// A cacheable HEAD response, expected to be fetched exactly `hits`
    /// times.
    pub async fn mock_head_expect(&mut self, path: &str, max_age: u64, hits: usize) -> Mock {
        self.server
            .mock("HEAD", path)
            .with_status(200)
            .with_header("content-type", "text/plain")
            .with_header("cache-control", &format!("max-age={max_age}"))
            .expect(hits)
            .create_async()
            .await
    }

    /// A POST pass-through response.
    pub async fn mock_post(&mut self, path: &str, body: &str) -> Mock {
        self.server
            .mock("POST", path)
            .with_status(200)
            .with_header("content-type", "text/plain")
            .with_body(body)
            .create_async()
            .await
    }

    /// A fixed upstream error status with no caching headers.
    pub async fn mock_status(&mut self, path: &str, status: usize, body: &str) -> Mock {
        self.server
            .mock("GET", path)
            .with_status(status)
            .with_body(body)
            .create_async()
            .await
    }
}
