//! Client implmentation.
//!
//! Operator CLI against the state server: submit image-processing requests,
//! inspect jobs and the DLQ, and record job outcomes on behalf of the
//! processing pipeline.

use clap::clap_app;

use imageserver::store::{AttemptState, JobOutcome, OutstandingJobRecord};
use imageserver::{protocol_request, StoreReq, StoreResp, SERVER_ADDR};

use prettytable::{cell, row, Table};

fn main() {
    let matches = clap_app! { client =>
        (about: "CLI client for the image job server")
        (@arg ADDR: --address +takes_value
         "The server IP:PORT (defaults to `localhost:3040`)")

        (@subcommand ping =>
            (about: "Ping the server")
        )

        (@subcommand job =>
            (about: "Operations on jobs.")

            (@subcommand submit =>
                (about: "Queue an image-processing request.")
                (@arg JOB_ID: +required
                 "Unique identifier for the job")
                (@arg IMAGE_URL: +required
                 "URL of the image to process")
                (@arg ENDPOINT: +required
                 "Model endpoint: a hosted endpoint name or an http(s) URL")
                (@arg NAME: --name +takes_value
                 "Human-readable job name")
                (@arg VARIANT: --variant +takes_value
                 "Pin a specific production variant")
                (@arg TILE_SIZE: --("tile-size") +takes_value {is_u32}
                 "Tile edge length in pixels (defaults to 512)")
                (@arg TILE_OVERLAP: --("tile-overlap") +takes_value {is_u32}
                 "Tile overlap in pixels (defaults to 32)")
                (@arg FORMAT: --format +takes_value
                 "Tile format (defaults to GTIFF)")
                (@arg COMPRESSION: --compression +takes_value
                 "Tile compression (defaults to NONE)")
                (@arg ROI: --roi +takes_value
                 "Region of interest as a WKT or GeoJSON polygon")
                (@arg READ_ROLE: --("read-role") +takes_value
                 "Credentials hint for reading the image")
            )

            (@subcommand ls =>
                (about: "List all jobs.")
                (@arg CSV: --csv
                 "Emit CSV instead of a table")
            )

            (@subcommand stat =>
                (about: "Get information on the status of a job.")
                (@arg ENDPOINT: +required
                 "The endpoint the job targets")
                (@arg JOB_ID: +required
                 "The job ID of the job")
            )

            (@subcommand complete =>
                (about: "Record the outcome of a finished job.")
                (@arg ENDPOINT: +required
                 "The endpoint the job targets")
                (@arg JOB_ID: +required
                 "The job ID of the job")
                (@arg OUTCOME: +required {is_outcome}
                 "The outcome of the attempt: `ok` or `failed`")
            )
        )

        (@subcommand dlq =>
            (about: "Operations on the dead-letter queue.")

            (@subcommand ls =>
                (about: "List dead-lettered requests and their causes.")
            )
        )
    }
    .setting(clap::AppSettings::SubcommandRequired)
    .setting(clap::AppSettings::DisableVersion)
    .get_matches();

    let addr = matches.value_of("ADDR").unwrap_or(SERVER_ADDR);

    run_inner(addr, &matches)
}

fn is_u32(s: String) -> Result<(), String> {
    s.parse::<u32>()
        .map(|_| ())
        .map_err(|e| format!("not an integer: {}", e))
}

fn is_outcome(s: String) -> Result<(), String> {
    match s.as_str() {
        "ok" | "failed" => Ok(()),
        other => Err(format!("expected `ok` or `failed`, got `{}`", other)),
    }
}

fn run_inner(addr: &str, matches: &clap::ArgMatches<'_>) {
    match matches.subcommand() {
        ("ping", _) => {
            let response = make_request(addr, StoreReq::Ping);
            println!("Server response: {:?}", response);
        }

        ("job", Some(sub_m)) => handle_job_cmd(addr, sub_m),

        ("dlq", Some(sub_m)) => handle_dlq_cmd(addr, sub_m),

        _ => unreachable!(),
    }
}

fn handle_job_cmd(addr: &str, matches: &clap::ArgMatches<'_>) {
    match matches.subcommand() {
        ("submit", Some(sub_m)) => {
            let body = serde_json::json!({
                "job_id": sub_m.value_of("JOB_ID").unwrap(),
                "job_name": sub_m.value_of("NAME").unwrap_or(""),
                "image_urls": [sub_m.value_of("IMAGE_URL").unwrap()],
                "outputs": [],
                "endpoint": sub_m.value_of("ENDPOINT").unwrap(),
                "variant": sub_m.value_of("VARIANT"),
                "tile_size": sub_m
                    .value_of("TILE_SIZE")
                    .map(|v| v.parse::<u32>().unwrap())
                    .unwrap_or(512),
                "tile_overlap": sub_m
                    .value_of("TILE_OVERLAP")
                    .map(|v| v.parse::<u32>().unwrap())
                    .unwrap_or(32),
                "tile_format": sub_m.value_of("FORMAT").unwrap_or("GTIFF"),
                "tile_compression": sub_m.value_of("COMPRESSION").unwrap_or("NONE"),
                "roi": sub_m.value_of("ROI"),
                "image_read_role": sub_m.value_of("READ_ROLE"),
            });

            let response = make_request(
                addr,
                StoreReq::SubmitRequest {
                    body: body.to_string(),
                },
            );
            println!("Server response: {:?}", response);
        }

        ("ls", Some(sub_m)) => {
            let records = list_jobs(addr);
            if sub_m.is_present("CSV") {
                print_jobs_csv(records);
            } else {
                print_jobs(records);
            }
        }

        ("stat", Some(sub_m)) => {
            let endpoint = sub_m.value_of("ENDPOINT").unwrap();
            let job_id = sub_m.value_of("JOB_ID").unwrap();

            let records = list_jobs(addr);
            match records
                .into_iter()
                .find(|r| r.endpoint_id == endpoint && r.job_id == job_id)
            {
                Some(record) => println!("{:#?}", record),
                None => println!("No such job: ({}, {})", endpoint, job_id),
            }
        }

        ("complete", Some(sub_m)) => {
            let outcome = match sub_m.value_of("OUTCOME").unwrap() {
                "ok" => JobOutcome::Succeeded,
                _ => JobOutcome::Failed,
            };

            let response = make_request(
                addr,
                StoreReq::Complete {
                    endpoint_id: sub_m.value_of("ENDPOINT").unwrap().into(),
                    job_id: sub_m.value_of("JOB_ID").unwrap().into(),
                    outcome,
                },
            );
            println!("Server response: {:?}", response);
        }

        _ => unreachable!(),
    }
}

fn handle_dlq_cmd(addr: &str, matches: &clap::ArgMatches<'_>) {
    match matches.subcommand() {
        ("ls", Some(_sub_m)) => {
            let letters = match make_request(addr, StoreReq::ListDlq) {
                StoreResp::DeadLetters(letters) => letters,
                other => {
                    println!("Unexpected server response: {:?}", other);
                    return;
                }
            };

            let mut table = Table::new();
            table.set_format(*prettytable::format::consts::FORMAT_CLEAN);
            table.set_titles(row![ Fwbu =>
                "At", "Cause", "Body"
            ]);

            for letter in letters {
                let mut body = letter.body;
                body.truncate(60);
                table.add_row(row![letter.at, Fr->letter.cause, body]);
            }

            table.printstd();
        }

        _ => unreachable!(),
    }
}

fn list_jobs(addr: &str) -> Vec<OutstandingJobRecord> {
    match make_request(addr, StoreReq::ListAll) {
        StoreResp::Records(records) => records,
        other => {
            println!("Unexpected server response: {:?}", other);
            std::process::exit(1);
        }
    }
}

fn print_jobs(records: Vec<OutstandingJobRecord>) {
    // Print a nice human-readable table
    let mut table = Table::new();

    table.set_format(*prettytable::format::consts::FORMAT_CLEAN);

    table.set_titles(row![ Fwbu =>
        "Endpoint", "Job", "Variant", "Regions", "State", "Attempts", "Created"
    ]);

    for record in records {
        let regions = match record.region_count {
            Some(count) => count.to_string(),
            None => "?".to_string(),
        };

        let created = record.created_at.to_rfc3339();

        match record.attempt_state {
            AttemptState::New => table.add_row(row![
                record.endpoint_id, b->record.job_id, record.variant, regions,
                Fb->"New", record.attempt_count, created
            ]),
            AttemptState::InProgress => table.add_row(row![
                record.endpoint_id, b->record.job_id, record.variant, regions,
                Fy->"In progress", record.attempt_count, created
            ]),
            AttemptState::Succeeded => table.add_row(row![
                record.endpoint_id, b->record.job_id, record.variant, regions,
                Fg->"Succeeded", record.attempt_count, created
            ]),
            AttemptState::Failed => table.add_row(row![
                record.endpoint_id, b->record.job_id, record.variant, regions,
                Frbu->"Failed", record.attempt_count, created
            ]),
        };
    }

    table.printstd();
}

fn print_jobs_csv(records: Vec<OutstandingJobRecord>) {
    let mut writer = csv::Writer::from_writer(std::io::stdout());

    writer
        .write_record(&[
            "endpoint", "job", "variant", "regions", "state", "attempts", "created",
        ])
        .expect("unable to write CSV");

    for record in records {
        writer
            .write_record(&[
                record.endpoint_id.as_str(),
                record.job_id.as_str(),
                record.variant.as_str(),
                &record
                    .region_count
                    .map(|c| c.to_string())
                    .unwrap_or_default(),
                state_name(record.attempt_state),
                &record.attempt_count.to_string(),
                &record.created_at.to_rfc3339(),
            ])
            .expect("unable to write CSV");
    }

    writer.flush().expect("unable to flush CSV");
}

fn state_name(state: AttemptState) -> &'static str {
    match state {
        AttemptState::New => "new",
        AttemptState::InProgress => "in-progress",
        AttemptState::Succeeded => "succeeded",
        AttemptState::Failed => "failed",
    }
}

fn make_request(addr: &str, request: StoreReq) -> StoreResp {
    match protocol_request(addr, &request) {
        Ok(response) => response,
        Err(e) => {
            println!("Unable to reach server at {}: {}", addr, e);
            std::process::exit(1);
        }
    }
}
