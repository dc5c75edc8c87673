use std::time::Duration;

use log::warn;

use crate::{
    app::LatestReading,
    config::DATA_LOG_FILE,
    datalog::{DataLog, LogError},
    provisioning::{apply_form, clear_and_restart, ProvisioningForm, Restarter},
    store::ConfigStore,
    types::{render_index, LatestReadingView},
};

pub const CONTENT_HTML: &str = "text/html; charset=utf-8";
pub const CONTENT_CSS: &str = "text/css";
pub const CONTENT_JS: &str = "text/javascript";
pub const CONTENT_CSV: &str = "text/csv";
pub const CONTENT_TEXT: &str = "text/plain; charset=utf-8";
pub const CONTENT_JSON: &str = "application/json; charset=utf-8";

pub const NOT_FOUND_BODY: &str = "File not found";

/// Transport-independent response; each platform writes it with its own server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub content_type: &'static str,
    pub headers: Vec<(&'static str, String)>,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn ok(content_type: &'static str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            content_type,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: CONTENT_TEXT,
            headers: Vec::new(),
            body: body.into().into_bytes(),
        }
    }

    pub fn not_found() -> Self {
        Self::text(404, NOT_FOUND_BODY)
    }

    fn with_header(mut self, name: &'static str, value: String) -> Self {
        self.headers.push((name, value));
        self
    }
}

pub fn index(template: &str, latest: &LatestReading) -> Reply {
    Reply::ok(CONTENT_HTML, render_index(template, latest.get().as_ref()))
}

/// `GET /getdata`: the raw log for the chart.
pub fn get_data(log: &DataLog) -> Reply {
    match log.read_all() {
        Ok(contents) => Reply::ok(CONTENT_CSV, contents),
        Err(err) => log_error_reply(err),
    }
}

/// `GET /download`: the raw log as an attachment.
pub fn download(log: &DataLog) -> Reply {
    match log.read_all() {
        Ok(contents) => {
            let (name, value) = attachment_header();
            Reply::ok(CONTENT_CSV, contents).with_header(name, value)
        }
        Err(err) => log_error_reply(err),
    }
}

/// `Content-Disposition` for the log download.
pub fn attachment_header() -> (&'static str, String) {
    (
        "Content-Disposition",
        format!("attachment; filename=\"{DATA_LOG_FILE}\""),
    )
}

pub fn delete(log: &DataLog) -> Reply {
    match log.delete() {
        Ok(()) => Reply::text(200, "Data file deleted"),
        Err(err) => log_error_reply(err),
    }
}

pub fn latest_json(latest: &LatestReading) -> Reply {
    let view = latest.get().as_ref().map(LatestReadingView::from);
    match serde_json::to_vec(&view) {
        Ok(body) => Reply::ok(CONTENT_JSON, body),
        Err(err) => Reply::text(500, format!("failed to encode reading: {err}")),
    }
}

/// `GET /clearconfig`: forget the network and restart into the access point.
pub fn clear_config<R: Restarter + ?Sized>(
    store: &ConfigStore,
    restarter: &R,
    delay: Duration,
) -> Reply {
    match clear_and_restart(store, restarter, delay) {
        Ok(()) => Reply::text(200, "Network configuration cleared. Restarting..."),
        Err(err) => Reply::text(500, format!("Failed to clear configuration: {err}")),
    }
}

/// `POST /` in access-point mode. The restart is scheduled whether or not the save worked.
pub fn submit_form<R: Restarter + ?Sized>(
    store: &ConfigStore,
    restarter: &R,
    delay: Duration,
    form: &ProvisioningForm,
) -> Reply {
    let reply = match apply_form(store, form) {
        Ok(message) => Reply::text(200, message),
        Err(err) => {
            warn!("failed to store provisioning form: {err}");
            Reply::text(500, format!("Failed to save configuration: {err}"))
        }
    };
    restarter.restart_after(delay);
    reply
}

/// A missing log is a 404; any other failure is logged and reported as a 500.
pub fn log_error_reply(err: LogError) -> Reply {
    match err {
        LogError::Missing(_) => Reply::not_found(),
        err => {
            warn!("data log access failed: {err}");
            Reply::text(500, err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ConfigField, testutil::ScratchDir, types::LogEntry};
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;

    #[derive(Default)]
    struct RecordingRestarter {
        delays: RefCell<Vec<Duration>>,
    }

    impl Restarter for RecordingRestarter {
        fn restart_after(&self, delay: Duration) {
            self.delays.borrow_mut().push(delay);
        }
    }

    fn log_with_row(dir: &ScratchDir) -> DataLog {
        let log = DataLog::new(dir.path().join(DATA_LOG_FILE), None);
        log.initialize().unwrap();
        log.append(&LogEntry {
            timestamp: "2024-05-01 12:00:00".to_string(),
            temperature: "21.00".to_string(),
        })
        .unwrap();
        log
    }

    #[test]
    fn getdata_returns_raw_csv() {
        let dir = ScratchDir::new("web-getdata");
        let reply = get_data(&log_with_row(&dir));

        assert_eq!(reply.status, 200);
        assert_eq!(reply.content_type, CONTENT_CSV);
        assert_eq!(
            String::from_utf8(reply.body).unwrap(),
            "Time,Temperature\n2024-05-01 12:00:00,21.00\n"
        );
    }

    #[test]
    fn missing_log_is_not_found() {
        let dir = ScratchDir::new("web-missing");
        let log = DataLog::new(dir.path().join(DATA_LOG_FILE), None);

        assert_eq!(get_data(&log), Reply::not_found());
        assert_eq!(download(&log), Reply::not_found());
        assert_eq!(delete(&log), Reply::not_found());
    }

    #[test]
    fn download_sets_attachment_name() {
        let dir = ScratchDir::new("web-download");
        let reply = download(&log_with_row(&dir));

        assert_eq!(
            reply.headers,
            vec![(
                "Content-Disposition",
                "attachment; filename=\"data.csv\"".to_string()
            )]
        );
    }

    #[test]
    fn delete_then_getdata_is_not_found() {
        let dir = ScratchDir::new("web-delete");
        let log = log_with_row(&dir);

        assert_eq!(delete(&log).status, 200);
        assert_eq!(get_data(&log).status, 404);
    }

    #[test]
    fn form_submission_restarts_after_delay() {
        let dir = ScratchDir::new("web-form");
        let store = ConfigStore::new(dir.path());
        let restarter = RecordingRestarter::default();
        let form = ProvisioningForm {
            ssid: Some("Home".to_string()),
            ip: Some("192.168.1.50".to_string()),
            ..ProvisioningForm::default()
        };

        let reply = submit_form(&store, &restarter, Duration::from_secs(3), &form);

        assert_eq!(reply.status, 200);
        assert!(String::from_utf8(reply.body)
            .unwrap()
            .ends_with("go to IP address: 192.168.1.50"));
        assert_eq!(*restarter.delays.borrow(), vec![Duration::from_secs(3)]);
        assert_eq!(
            std::fs::read_to_string(store.path_for(ConfigField::NetworkName)).unwrap(),
            "Home"
        );
    }

    #[test]
    fn latest_json_is_null_before_first_reading() {
        let reply = latest_json(&LatestReading::default());

        assert_eq!(reply.content_type, CONTENT_JSON);
        assert_eq!(reply.body, b"null".to_vec());
    }
}
