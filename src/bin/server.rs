//! State server implmentation.
//!
//! Hosts the fleet's shared state: the outstanding-jobs store, the request
//! FIFO, and the dead-letter queue. All mutation funnels through this one
//! process, which is what makes the store's conditional operations a
//! serializable ordering point for every worker.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};

use clap::clap_app;

use imageserver::config::SchedulerConfig;
use imageserver::error::SchedError;
use imageserver::queue::{MemQueue, RequestQueue};
use imageserver::store::{JobStore, MemStore};
use imageserver::{StoreReq, StoreResp, SERVER_ADDR};

use log::{error, info};

/// The server's state.
struct Server {
    store: MemStore,
    queue: MemQueue,
}

impl Server {
    /// Creates a new server. Not listening yet.
    fn new(config: &SchedulerConfig) -> Self {
        Server {
            store: MemStore::new(config.record_ttl),
            queue: MemQueue::new(config.max_receive_count),
        }
    }

    fn listen(&self, listen_addr: &str) {
        let listener = match TcpListener::bind(listen_addr) {
            Ok(listener) => listener,
            Err(e) => {
                error!("Unable to listen at `{}`: {}", listen_addr, e);
                info!("Exiting");
                std::process::exit(1);
            }
        };

        // accept incoming streams and process them.
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => match self.handle_client(stream) {
                    Ok(()) => {}
                    Err(e) => error!("Error while handling client: {}", e),
                },
                Err(e) => error!("Error while handling client: {}", e),
            }
        }
    }

    fn handle_client(&self, mut client: TcpStream) -> std::io::Result<()> {
        let peer_addr = client.peer_addr()?;

        let mut request = String::new();
        client.read_to_string(&mut request)?;

        let request: StoreReq = serde_json::from_str(&request)?;

        info!("(request) {}: {:?}", peer_addr, request);

        client.shutdown(Shutdown::Read)?;

        let response = self.handle_request(request);

        info!("(response) {}: {:?}", peer_addr, response);

        let response = serde_json::to_string(&response)?;

        client.write_all(response.as_bytes())?;

        Ok(())
    }

    fn handle_request(&self, request: StoreReq) -> StoreResp {
        use StoreReq::*;

        match request {
            Ping => StoreResp::Ok,

            SubmitRequest { body } => match self.queue.submit(&body) {
                Ok(()) => StoreResp::Ok,
                Err(e) => {
                    error!("Submit failed: {}", e);
                    StoreResp::NoSuchMessage
                }
            },

            ReceiveRequests { max } => match self.queue.receive(max) {
                Ok(messages) => StoreResp::Messages(messages),
                Err(e) => {
                    error!("Receive failed: {}", e);
                    StoreResp::Messages(Vec::new())
                }
            },

            DeleteMessage { receipt } => match self.queue.delete(&receipt) {
                Ok(()) => StoreResp::Ok,
                Err(_) => StoreResp::NoSuchMessage,
            },

            PublishDlq { body, cause } => match self.queue.publish_dlq(&body, &cause) {
                Ok(()) => StoreResp::Ok,
                Err(e) => {
                    error!("DLQ publish failed: {}", e);
                    StoreResp::NoSuchMessage
                }
            },

            ListDlq => match self.queue.list_dlq() {
                Ok(letters) => StoreResp::DeadLetters(letters),
                Err(e) => {
                    error!("DLQ listing failed: {}", e);
                    StoreResp::DeadLetters(Vec::new())
                }
            },

            Insert { record } => match self.store.insert(record) {
                Ok(()) => StoreResp::Ok,
                Err(SchedError::DuplicateJob { .. }) => StoreResp::DuplicateJob,
                Err(e) => {
                    error!("Insert failed: {}", e);
                    StoreResp::NoSuchJob
                }
            },

            ListOutstanding => match self.store.list_outstanding() {
                Ok(records) => StoreResp::Records(records),
                Err(e) => {
                    error!("Listing failed: {}", e);
                    StoreResp::Records(Vec::new())
                }
            },

            ListForEndpoint { endpoint_id } => match self.store.list_for_endpoint(&endpoint_id) {
                Ok(records) => StoreResp::Records(records),
                Err(e) => {
                    error!("Listing failed: {}", e);
                    StoreResp::Records(Vec::new())
                }
            },

            ListAll => StoreResp::Records(self.store.list_all()),

            StartNextAttempt {
                endpoint_id,
                job_id,
            } => match self.store.start_next_attempt(&endpoint_id, &job_id) {
                Ok(won) => StoreResp::Started(won),
                Err(_) => StoreResp::NoSuchJob,
            },

            Complete {
                endpoint_id,
                job_id,
                outcome,
            } => match self.store.complete(&endpoint_id, &job_id, outcome) {
                Ok(()) => StoreResp::Ok,
                Err(_) => StoreResp::NoSuchJob,
            },

            TouchTtl {
                endpoint_id,
                job_id,
            } => match self.store.touch_ttl(&endpoint_id, &job_id) {
                Ok(()) => StoreResp::Ok,
                Err(_) => StoreResp::NoSuchJob,
            },
        }
    }
}

fn main() {
    let matches = clap_app! { server =>
        (about: "Hosts the shared job store, request FIFO, and DLQ for a fleet of workers")
        (@arg ADDR: --addr +takes_value
         "The IP:PORT for the server to listen on \
         (defaults to `localhost:3040`)")
    }
    .get_matches();

    let addr = matches.value_of("ADDR").unwrap_or(SERVER_ADDR);

    // Start logger
    env_logger::init();

    let config = SchedulerConfig::from_env();

    info!("Starting state server at {}", addr);

    let server = Server::new(&config);
    server.listen(addr);
}
