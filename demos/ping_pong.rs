//! Two peers over a TCP loopback pair, each answering the other's `ping`
//! with a `pong` a handful of times. Run with `cargo run --example ping_pong`.

use ccrpc::bag::Params;
use ccrpc::call::{Call, HandlerAction};
use ccrpc::connection::{Connection, ConnectionOptions};
use std::net::{TcpListener, TcpStream};
use std::thread;

const ROUNDS: u32 = 5;

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt::init();
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;

    let server = thread::spawn(move || -> std::io::Result<()> {
        let (sock, _) = listener.accept()?;
        let conn = Connection::from_tcp_stream(sock, ConnectionOptions::default())?;
        conn.listen(Box::new(|call: &mut Call| {
            let n: u32 = call.params().get_str("n").and_then(|s| s.parse().ok()).unwrap_or(0);
            println!("server: got ping #{n}");
            let mut reply = Params::new();
            reply.insert("n", n.to_string());
            if n >= ROUNDS {
                HandlerAction::AnswerAndExit(reply)
            } else {
                HandlerAction::Answer(reply)
            }
        }))
        .ok();
        Ok(())
    });

    let client = Connection::from_tcp_stream(TcpStream::connect(addr)?, ConnectionOptions::default())?;
    for round in 1..=ROUNDS {
        let mut params = Params::new();
        params.insert("n", round.to_string());
        let answer = client.call("ping", params, None).expect("ping failed");
        if let ccrpc::Answer::Bag(bag) = answer {
            println!("client: pong #{}", bag.get_str("n").unwrap_or("?"));
        }
    }
    client.detach();
    drop(client);
    server.join().unwrap()?;
    Ok(())
}
