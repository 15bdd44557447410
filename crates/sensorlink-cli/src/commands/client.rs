use std::thread;

use log::{error, warn};
use sensorlink_core::{ClientConfig, ClientSession, ReportPolicy, SessionSummary, WindowAverage};

pub struct ClientCommandConfig {
    pub host: String,
    pub port: u16,
    pub rate: f64,
    pub window: usize,
    pub every_full_window: bool,
    pub json: bool,
}

impl ClientCommandConfig {
    fn session_config(&self) -> ClientConfig {
        ClientConfig {
            host: self.host.clone(),
            port: self.port,
            frequency_hz: self.rate,
            window_size: self.window,
            report_policy: if self.every_full_window {
                ReportPolicy::EveryFullWindow
            } else {
                ReportPolicy::FirstFill
            },
            ..Default::default()
        }
    }
}

/// Run a client session; returns the process exit code.
pub fn run(cmd: ClientCommandConfig) -> i32 {
    let mut session = match ClientSession::connect(cmd.session_config()) {
        Ok(session) => session,
        Err(e) => {
            error!("{e}");
            return 1;
        }
    };

    let stop = session.stop_handle();
    if let Err(e) = ctrlc::set_handler(move || stop.stop()) {
        warn!("could not install Ctrl+C handler: {e}");
    }

    let json = cmd.json;
    let reports = session.reports();
    let printer = thread::spawn(move || {
        for avg in reports {
            print_average(&avg, json);
        }
    });

    let summary = match session.start() {
        Ok(summary) => summary,
        Err(e) => {
            error!("could not start session: {e}");
            return 1;
        }
    };
    // Ends once the ingestion thread drops its sender.
    if printer.join().is_err() {
        warn!("report printer panicked");
    }

    print_summary(&summary, json);
    if summary.outcome.is_fault() { 1 } else { 0 }
}

fn print_average(avg: &WindowAverage, json: bool) {
    if json {
        match serde_json::to_string(avg) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!("could not encode report: {e}"),
        }
    } else {
        println!("{} average ({} samples): {:.3}", avg.tag.label(), avg.samples, avg.mean);
    }
}

fn print_summary(summary: &SessionSummary, json: bool) {
    if json {
        match serde_json::to_string(summary) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!("could not encode summary: {e}"),
        }
        return;
    }

    println!();
    println!("Session {} with {}", summary.session_id, summary.peer);
    println!("  ended:      {}", summary.outcome);
    println!("  elapsed:    {:.2?}", summary.elapsed);
    println!(
        "  requests:   {} ({:.1} Hz achieved, {} late)",
        summary.pacer.requests_sent,
        summary.achieved_rate_hz(),
        summary.pacer.behind_count
    );
    println!(
        "  records:    {} ({} unknown, {} malformed)",
        summary.ingest.records, summary.ingest.unknown_lines, summary.ingest.malformed_lines
    );
    println!("  averages:   {}", summary.ingest.reports);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(every_full_window: bool) -> ClientCommandConfig {
        ClientCommandConfig {
            host: "sensors.local".to_string(),
            port: 9000,
            rate: 120.0,
            window: 10,
            every_full_window,
            json: false,
        }
    }

    #[test]
    fn test_flags_map_onto_session_config() {
        let config = cmd(false).session_config();
        assert_eq!(config.host, "sensors.local");
        assert_eq!(config.port, 9000);
        assert_eq!(config.frequency_hz, 120.0);
        assert_eq!(config.window_size, 10);
        assert_eq!(config.report_policy, ReportPolicy::FirstFill);
        assert_eq!(cmd(true).session_config().report_policy, ReportPolicy::EveryFullWindow);
    }

    #[test]
    fn test_connect_failure_exits_nonzero() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let code = run(ClientCommandConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..cmd(false)
        });
        assert_eq!(code, 1);
    }
}
