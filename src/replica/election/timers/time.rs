use tokio::time::{Duration, Instant};

/// Timer tasks read time through this so tests can drive them with a mock.
#[async_trait::async_trait]
pub(crate) trait Clock: Clone + Send + Sync + 'static {
    fn now(&self) -> Instant;

    async fn sleep_until(&mut self, deadline: Instant);

    async fn sleep(&mut self, duration: Duration) {
        let deadline = self.now() + duration;
        self.sleep_until(deadline).await;
    }
}

#[derive(Copy, Clone)]
pub(crate) struct RealClock;

#[async_trait::async_trait]
impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&mut self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}

#[cfg(test)]
pub(crate) use mock::{mocked_clock, MockClockController};
