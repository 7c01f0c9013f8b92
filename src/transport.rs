use std::io;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::common::{deserialize, serialize, Address, Opaque};

/// A decoded inbound datagram: destination channel, sender, payload.
pub type Inbound = (String, Address, Opaque);

/// Default latency bound for the random delay applied to each send and
/// each delivery.
pub const DELAY_MAX: Duration = Duration::from_secs(2);

/// Unreliable datagram endpoint shared by all link leaves of a stack.
///
/// Implementations model a real network: every outbound send and every
/// inbound delivery is scheduled after a random delay uniform in
/// `[0, DELAY_MAX)`. Loss is allowed; the link layer above compensates.
pub trait Endpoint: Send + Sync {
    fn send(&self, channel: &str, dest: Address, message: Opaque);
}

/// Send half of one registered channel. Held by a fair-loss link leaf; the
/// channel name is the module's instance name, identical on every process.
#[derive(Clone)]
pub struct LinkSender {
    channel: Arc<str>,
    endpoint: Arc<dyn Endpoint>,
}

impl LinkSender {
    pub(crate) fn new(channel: &str, endpoint: Arc<dyn Endpoint>) -> Self {
        Self {
            channel: channel.into(),
            endpoint,
        }
    }

    pub fn send(&self, dest: Address, message: Opaque) {
        self.endpoint.send(&self.channel, dest, message);
    }
}

pub(crate) fn random_delay(max: Duration) -> Duration {
    max.mul_f64(rand::thread_rng().gen::<f64>())
}

fn encode_frame(channel: &str, message: &[u8]) -> Opaque {
    serialize(&(channel, message))
}

/// Kernel UDP endpoint. One socket per process stack; a background task
/// decodes inbound frames and feeds the stack's inbound queue after the
/// delivery-side delay.
pub struct UdpEndpoint {
    socket: Arc<UdpSocket>,
    delay_max: Duration,
}

impl UdpEndpoint {
    pub async fn bind(
        addr: Address,
        delay_max: Duration,
    ) -> io::Result<(Arc<Self>, UnboundedReceiver<Inbound>)> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::read_loop(socket.clone(), tx, delay_max));
        Ok((Arc::new(Self { socket, delay_max }), rx))
    }

    async fn read_loop(
        socket: Arc<UdpSocket>,
        tx: UnboundedSender<Inbound>,
        delay_max: Duration,
    ) {
        let mut buffer = vec![0; 64 << 10];
        loop {
            let (length, src) = match socket.recv_from(&mut buffer).await {
                Ok(received) => received,
                Err(err) => {
                    warn!("udp receive failed: {}", err);
                    continue;
                }
            };
            let (channel, message): (String, Opaque) = match deserialize(&buffer[..length]) {
                Ok(frame) => frame,
                Err(_) => {
                    warn!("bad datagram from {}", src);
                    continue;
                }
            };
            let tx = tx.clone();
            let delay = random_delay(delay_max);
            tokio::spawn(async move {
                sleep(delay).await;
                let _ = tx.send((channel, src, message));
            });
        }
    }
}

impl Endpoint for UdpEndpoint {
    fn send(&self, channel: &str, dest: Address, message: Opaque) {
        let frame = encode_frame(channel, &message);
        let socket = self.socket.clone();
        let delay = random_delay(self.delay_max);
        tokio::spawn(async move {
            sleep(delay).await;
            if let Err(err) = socket.send_to(&frame, dest).await {
                debug!("send to {} failed: {}", dest, err);
            }
        });
    }
}
