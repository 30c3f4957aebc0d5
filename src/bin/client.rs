//! Chat relay client - Entry Point
//!
//! Asks for a name, joins the server's room and relays stdin lines.
//! Type `q` to leave.

use std::env;
use std::io::{self, BufRead, Write};
use std::process::ExitCode;

use tokio::sync::mpsc;
use tracing::{debug, error};

use chat_relay::config::ClientConfig;
use chat_relay::{logging, AppError, ChatClient, ChatEvent};

const INPUT_BUFFER_SIZE: usize = 16;
const EVENT_BUFFER_SIZE: usize = 64;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = ClientConfig::from_args(env::args().skip(1))?;
    logging::init(&config.log)?;

    let author = prompt_name()?;
    let client = ChatClient::connect(&config.server_url(), author).await?;

    let (input_tx, input_rx) = mpsc::channel(INPUT_BUFFER_SIZE);
    let (events_tx, mut events_rx) = mpsc::channel(EVENT_BUFFER_SIZE);

    // Stdin blocks, so lines are read on a dedicated thread
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if input_tx.blocking_send(line).is_err() {
                break;
            }
        }
        debug!("Input closed");
    });

    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                ChatEvent::Joined => println!("Joined the chat. Type q to leave."),
                ChatEvent::Message(msg) => println!("{}: {}", msg.author, msg.body),
                ChatEvent::Shutdown => println!("Server is shutting down."),
                ChatEvent::Disconnected => println!("Disconnected from server."),
            }
        }
    });

    let result: Result<(), AppError> = tokio::select! {
        res = client.run(input_rx, events_tx) => res,
        res = tokio::signal::ctrl_c() => res.map_err(AppError::from),
    };

    // The event sender is gone once the client stops
    if let Err(e) = printer.await {
        error!("Printer task failed: {}", e);
    }

    result.map_err(Into::into)
}

fn prompt_name() -> io::Result<String> {
    print!("Enter your name: ");
    io::stdout().flush()?;

    let mut name = String::new();
    io::stdin().lock().read_line(&mut name)?;
    Ok(name.trim().to_string())
}
