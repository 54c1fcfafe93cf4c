//! In-process Modbus-TCP counter module
//!
//! Answers function 0x03 from a shared register map. Switches let a test
//! silence the device, drop every open session, or refuse sessions by
//! closing them right after accept.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use cntsrv::protocol::codec::{encode_read_response, parse_read_request_pdu};
use cntsrv::protocol::{split_value, MbapHeader, RegisterWidth, WordOrder, MBAP_HEADER_LEN};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Default)]
struct State {
    registers: Mutex<HashMap<u16, u16>>,
    silent: AtomicBool,
    refusing: AtomicBool,
    connections: AtomicU64,
    requests: AtomicU64,
}

pub struct CounterSimulator {
    addr: SocketAddr,
    state: Arc<State>,
    drop_tx: watch::Sender<u64>,
    task: JoinHandle<()>,
}

impl CounterSimulator {
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(State::default());
        let (drop_tx, drop_rx) = watch::channel(0u64);

        let task = tokio::spawn({
            let state = state.clone();
            async move {
                while let Ok((socket, _)) = listener.accept().await {
                    state.connections.fetch_add(1, Ordering::SeqCst);
                    if state.refusing.load(Ordering::SeqCst) {
                        drop(socket);
                        continue;
                    }
                    tokio::spawn(serve(socket, state.clone(), drop_rx.clone()));
                }
            }
        });

        Ok(Self {
            addr,
            state,
            drop_tx,
            task,
        })
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn set_register(&self, address: u16, value: u16) {
        self.state.registers.lock().insert(address, value);
    }

    /// Store a counter over one or two registers
    pub fn set_counter(&self, address: u16, width: RegisterWidth, order: WordOrder, value: u64) {
        let words = split_value(value, width, order);
        let mut registers = self.state.registers.lock();
        for (i, word) in words.into_iter().enumerate() {
            registers.insert(address + i as u16, word);
        }
    }

    /// Stop answering requests while keeping sessions open
    pub fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::SeqCst);
    }

    /// Close new sessions immediately after accept
    pub fn set_refusing(&self, refusing: bool) {
        self.state.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Close every open session
    pub fn drop_connections(&self) {
        self.drop_tx.send_modify(|generation| *generation += 1);
    }

    pub fn connections(&self) -> u64 {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> u64 {
        self.state.requests.load(Ordering::SeqCst)
    }
}

impl Drop for CounterSimulator {
    fn drop(&mut self) {
        self.task.abort();
        self.drop_connections();
    }
}

async fn serve(mut socket: TcpStream, state: Arc<State>, mut drop_rx: watch::Receiver<u64>) {
    drop_rx.mark_unchanged();
    loop {
        let mut frame = [0u8; MBAP_HEADER_LEN + 5];
        tokio::select! {
            read = socket.read_exact(&mut frame) => {
                if read.is_err() {
                    return;
                }
            }
            _ = drop_rx.changed() => return,
        }
        state.requests.fetch_add(1, Ordering::SeqCst);

        if state.silent.load(Ordering::SeqCst) {
            continue;
        }

        let Ok(header) = MbapHeader::decode(&frame) else {
            return;
        };
        let Ok((start, quantity)) = parse_read_request_pdu(&frame[MBAP_HEADER_LEN..]) else {
            return;
        };
        let words: Vec<u16> = {
            let registers = state.registers.lock();
            (0..quantity)
                .map(|i| registers.get(&(start + i)).copied().unwrap_or(0))
                .collect()
        };
        let reply = encode_read_response(header.transaction_id, header.unit_id, &words);
        if socket.write_all(&reply).await.is_err() {
            return;
        }
    }
}
