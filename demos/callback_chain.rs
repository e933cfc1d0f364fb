//! One peer asks the other to `double_it`, which issues a nested call-back
//! (`multiply_by_two`) back at the caller before answering. Demonstrates
//! that call-backs are ordinary calls travelling the other direction over
//! the same pair of streams. Run with `cargo run --example callback_chain`.

use ccrpc::bag::Params;
use ccrpc::call::{Call, HandlerAction};
use ccrpc::connection::{Answer, Connection, ConnectionOptions};
use std::net::{TcpListener, TcpStream};
use std::thread;

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt::init();
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;

    let server = thread::spawn(move || -> std::io::Result<()> {
        let (sock, _) = listener.accept()?;
        let conn = Connection::from_tcp_stream(sock, ConnectionOptions::default())?;
        conn.listen(Box::new(|call: &mut Call| {
            let n: i64 = call.params().get_str("n").and_then(|s| s.parse().ok()).unwrap_or(0);
            let mut cb_params = Params::new();
            cb_params.insert("n", n.to_string());
            let cb_answer = call.call_back("multiply_by_two", cb_params, None).unwrap();
            let doubled = match cb_answer {
                Answer::Bag(bag) => bag.get_str("result").and_then(|s| s.parse::<i64>().ok()).unwrap_or(0),
                _ => 0,
            };
            let mut reply = Params::new();
            reply.insert("result", doubled.to_string());
            HandlerAction::Answer(reply)
        }))
        .ok();
        Ok(())
    });

    let client = Connection::from_tcp_stream(TcpStream::connect(addr)?, ConnectionOptions::default())?;
    let mut params = Params::new();
    params.insert("n", "21");
    let answer = client
        .call(
            "double_it",
            params,
            Some(Box::new(|call: &mut Call| {
                let n: i64 = call.params().get_str("n").and_then(|s| s.parse().ok()).unwrap_or(0);
                let mut reply = Params::new();
                reply.insert("result", (n * 2).to_string());
                HandlerAction::Answer(reply)
            })),
        )
        .expect("double_it failed");
    if let Answer::Bag(bag) = answer {
        println!("21 doubled is {}", bag.get_str("result").unwrap_or("?"));
    }
    client.detach();
    drop(client);
    server.join().unwrap()?;
    Ok(())
}
