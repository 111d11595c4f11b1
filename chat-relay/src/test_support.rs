use std::{future::pending, time::Duration};

use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::{tcp::OwnedReadHalf, TcpListener, TcpStream},
    time::timeout,
};

use crate::{
    outbound,
    relay::{self, SlotId},
    table::{default_nickname, Slot},
};

pub(crate) const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Returns the server and client ends of a fresh loopback connection.
pub(crate) async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let (server, _) = accepted.expect("accept");
    (server, client.expect("connect"))
}

/// A slot whose worker never sends anything and never exits.
pub(crate) fn idle_slot(server: TcpStream, id: SlotId) -> Slot {
    let (_reader, writer) = server.into_split();
    let (relay_tx, relay_rx) = relay::channel(id, 4096);
    let worker = tokio::spawn(async move {
        let _relay_tx = relay_tx;
        pending::<()>().await;
    });
    Slot::new(
        outbound::spawn(writer, id, 16),
        relay_rx,
        worker,
        default_nickname(id),
        None,
    )
}

pub(crate) async fn read_line(reader: &mut BufReader<OwnedReadHalf>) -> Option<String> {
    let mut line = String::new();
    let bytes = timeout(READ_TIMEOUT, reader.read_line(&mut line))
        .await
        .expect("timed out waiting for line")
        .expect("read line");
    if bytes == 0 {
        return None;
    }
    Some(line.trim_end_matches(['\r', '\n']).to_string())
}
