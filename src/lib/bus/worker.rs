use log::debug;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

use super::{Bus, Outcome, PumpError};
use crate::protocol::{Address, Primitive, Status};
use crate::regs::RegisterModel;
use crate::transport::Transport;

type Job<T> = Box<dyn FnOnce(&mut Bus<T>) + Send>;

/// Thread owning a [`Bus`]; transactions run strictly one after another.
pub struct BusWorker<T: Transport> {
    handle: JoinHandle<Bus<T>>,
}

impl<T: Transport + 'static> BusWorker<T> {
    pub fn spawn(mut bus: Bus<T>) -> (Self, BusClient<T>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job<T>>();

        let handle = thread::spawn(move || {
            debug!("bus worker started");
            while let Some(job) = rx.blocking_recv() {
                job(&mut bus);
            }
            debug!("bus worker stopped");
            bus
        });

        (BusWorker { handle }, BusClient { tx })
    }

    /// Waits for every client to go away and returns the bus.
    pub fn join(self) -> thread::Result<Bus<T>> {
        self.handle.join()
    }
}

/// Cloneable handle submitting work to a [`BusWorker`].
pub struct BusClient<T: Transport> {
    tx: mpsc::UnboundedSender<Job<T>>,
}

impl<T: Transport> Clone for BusClient<T> {
    fn clone(&self) -> Self {
        BusClient {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Transport + 'static> BusClient<T> {
    /// Runs `f` on the worker thread with exclusive use of the bus.
    pub async fn with_bus<R, F>(&self, f: F) -> Result<R, PumpError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Bus<T>) -> R + Send + 'static,
    {
        let (reply, wait) = oneshot::channel();
        self.tx
            .send(Box::new(move |bus: &mut Bus<T>| {
                let _ = reply.send(f(bus));
            }))
            .map_err(|_| PumpError::Disconnected)?;
        wait.await.map_err(|_| PumpError::Disconnected)
    }

    pub async fn run(&self, address: Address, primitives: Vec<Primitive>) -> Result<Outcome, PumpError> {
        self.with_bus(move |bus| bus.run(address, &primitives))
            .await?
    }

    pub async fn status(&self, address: Address) -> Result<Status, PumpError> {
        self.with_bus(move |bus| bus.status(address)).await?
    }

    pub async fn initialize(&self, address: Address) -> Result<Status, PumpError> {
        self.with_bus(move |bus| bus.initialize(address)).await?
    }

    /// Snapshot of the pump's model.
    pub async fn model(&self, address: Address) -> Result<Option<RegisterModel>, PumpError> {
        self.with_bus(move |bus| bus.model(address).cloned()).await
    }

    /// Like [`Bus::wait_ready`], but the settle pause and each poll leave
    /// the bus free, so other pumps' transactions run in between.
    pub async fn wait_ready(
        &self,
        address: Address,
        timeout: Duration,
        interval: Duration,
    ) -> Result<Status, PumpError> {
        let deadline = Instant::now() + timeout;
        let settle = self
            .with_bus(move |bus| bus.settle_delay(address))
            .await?
            .min(timeout);
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }
        loop {
            let status = self.status(address).await?;
            if let Some(error) = status.error {
                return Err(PumpError::Device { address, error });
            }
            if status.is_ready() {
                return Ok(status);
            }
            if Instant::now() + interval > deadline {
                return Err(PumpError::WaitTimeout(address, timeout));
            }
            tokio::time::sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConfig, ProtocolConfig};
    use crate::sim::SimulatedBus;

    fn pump(n: u8) -> Address {
        Address::new(n).unwrap()
    }

    fn spawn(addresses: &[u8]) -> (BusWorker<SimulatedBus>, BusClient<SimulatedBus>, SimulatedBus) {
        let protocol = ProtocolConfig {
            retry_backoff: Duration::ZERO,
            ..ProtocolConfig::default()
        };
        let sim = SimulatedBus::new(protocol);
        let mut bus = Bus::new(sim.clone(), protocol);
        for &n in addresses {
            let config = DeviceConfig::new(pump(n)).with_ports(1..=6);
            sim.add_pump(config.clone());
            bus.add_device(config);
        }
        let (worker, client) = BusWorker::spawn(bus);
        (worker, client, sim)
    }

    #[tokio::test]
    async fn concurrent_pumps_share_the_bus() {
        let (worker, client, sim) = spawn(&[0, 1]);
        sim.set_busy_polls(pump(0), 2);
        sim.set_busy_polls(pump(1), 2);

        let a = client.clone();
        let b = client.clone();
        let first = tokio::spawn(async move {
            a.initialize(pump(0)).await?;
            a.wait_ready(pump(0), Duration::from_secs(1), Duration::from_millis(1))
                .await?;
            a.run(pump(0), vec![Primitive::valve(3), Primitive::MoveAbsolute(1200)])
                .await
        });
        let second = tokio::spawn(async move {
            b.initialize(pump(1)).await?;
            b.wait_ready(pump(1), Duration::from_secs(1), Duration::from_millis(1))
                .await?;
            b.run(pump(1), vec![Primitive::MoveAbsolute(800)]).await
        });

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let zero = client.model(pump(0)).await.unwrap().unwrap();
        assert_eq!(zero.plunger_position(), Some(1200));
        assert_eq!(zero.valve_port(), Some(3));
        let one = client.model(pump(1)).await.unwrap().unwrap();
        assert_eq!(one.plunger_position(), Some(800));

        drop(client);
        let bus = worker.join().unwrap();
        assert_eq!(bus.model(pump(1)).unwrap().plunger_position(), Some(800));
    }

    #[tokio::test]
    async fn settle_pause_frees_the_bus() {
        let (_worker, client, sim) = spawn(&[0, 1]);
        client.initialize(pump(0)).await.unwrap();
        client.initialize(pump(1)).await.unwrap();

        // a full stroke keeps pump 0 busy for seconds on paper
        let slow = client
            .run(pump(0), vec![Primitive::MoveAbsolute(3000)])
            .await
            .unwrap();
        assert!(slow.estimate > Duration::from_secs(1));

        let waiter = client.clone();
        let wait = tokio::spawn(async move {
            waiter
                .wait_ready(pump(0), Duration::from_millis(300), Duration::from_millis(1))
                .await
        });

        // pump 1 is served while pump 0 settles
        let started = Instant::now();
        client
            .run(pump(1), vec![Primitive::MoveAbsolute(5)])
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(200));

        // the sim finishes at once, so the first poll after the pause is ready
        let polls = sim.writes();
        assert!(wait.await.unwrap().unwrap().is_ready());
        assert_eq!(sim.writes() - polls, 1);
    }

    #[tokio::test]
    async fn worker_outlives_dropped_clones() {
        let (worker, client, _sim) = spawn(&[0]);
        let stale = client.clone();
        drop(client);

        // the worker only stops once every handle is gone
        assert!(stale.status(pump(0)).await.is_ok());
        drop(stale);
        assert!(worker.join().is_ok());
    }
}
