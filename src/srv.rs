use std::io::{BufRead, BufReader, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time;

use url::Url;

use crate::clock::Clock;
use crate::error::{Error, ErrorKind};
use crate::landing::{self, CollisionPolicy, LandedFile, LandingError};
use crate::naming;
use crate::partition;

const UPLOAD_PATH: &str = "/up";
const NAME_PARAM: &str = "name";

type Response = tiny_http::Response<Cursor<Vec<u8>>>;

/// Everything needed to turn a request into a landed file.
pub struct Intake {
    root_dir: PathBuf,
    clock: Box<dyn Clock>,
    collision: CollisionPolicy,
}

fn storage_error(err: LandingError) -> Error {
    log::error!("{}", err);
    Error::from(err)
}

impl Intake {
    pub fn new(root_dir: PathBuf, clock: Box<dyn Clock>, collision: CollisionPolicy) -> Self {
        Intake {
            root_dir,
            clock,
            collision,
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Validates the request and lands its body. Nothing touches the
    /// filesystem until every check has passed.
    pub fn handle(
        &self,
        method: &tiny_http::Method,
        url: &str,
        body: &mut dyn Read,
    ) -> Result<LandedFile, Error> {
        let base = Url::parse("http://localhost/").map_err(|e| {
            Error::new(ErrorKind::ServerError, format!("base url: {}", e))
        })?;
        let url = base
            .join(url)
            .map_err(|_| Error::new(ErrorKind::UserError, "Bad request target."))?;

        if url.path() != UPLOAD_PATH {
            return Err(Error::new(
                ErrorKind::NotFound,
                format!("There's nothing at {}.", url.path()),
            ));
        }

        if *method != tiny_http::Method::Put {
            return Err(Error::new(ErrorKind::MethodNotAllowed, "Wrong method."));
        }

        let mut body = BufReader::new(body);
        let first_chunk = body.fill_buf().map_err(|e| {
            log::warn!("Unable to read request body: {}", e);
            Error::new(ErrorKind::UserError, "Unable to read request body.")
        })?;
        if first_chunk.is_empty() {
            return Err(Error::new(ErrorKind::UserError, "Empty file body."));
        }

        let name = url
            .query_pairs()
            .find(|(k, _)| k == NAME_PARAM)
            .map(|(_, v)| v.into_owned());
        let base_name = naming::validate_base_name(name.as_deref())
            .map_err(|e| Error::new(ErrorKind::UserError, e.message()))?;

        let now = self.clock.now();
        let work_dir = partition::resolve(&self.root_dir, &now).map_err(storage_error)?;
        let file_name = naming::format_name(&now, base_name);

        landing::land(&work_dir, &file_name, &mut body, self.collision).map_err(storage_error)
    }

    fn serve(&self, mut req: tiny_http::Request) {
        let start_t = time::Instant::now();
        let method = req.method().clone();
        let url = req.url().to_string();
        let body_length = req.body_length().map(|len| len as u64);
        let mut body = landing::ExactLength::new(req.as_reader(), body_length);

        let resp = match self.handle(&method, &url, &mut body) {
            Ok(landed) => {
                log::info!("Stored {} ({} bytes)", landed.path.display(), landed.size);
                Response::from_data(Vec::new())
            }
            Err(err) => {
                log::warn!("{} => {}", url, err);
                Response::from_string(err.as_text()).with_status_code(err.as_http_code())
            }
        };
        let status = resp.status_code().0;

        let make_resp_dur = start_t.elapsed();
        let respond_result = req.respond(resp);
        let resp_complete_dur = start_t.elapsed();

        match respond_result {
            Ok(()) => log::info!(
                "{:6} [{:8} us, {:8} us] {} {}",
                method.as_str(),
                make_resp_dur.as_micros(),
                resp_complete_dur.as_micros(),
                status,
                url
            ),
            Err(err) => log::warn!(
                "{:6} [{:8} us, {:8} us] {} {} => {}",
                method.as_str(),
                make_resp_dur.as_micros(),
                resp_complete_dur.as_micros(),
                status,
                url,
                err
            ),
        }
    }
}

/// Stops a running [`Srv`] from another thread, e.g. a signal handler.
#[derive(Clone)]
pub struct ShutdownHandle {
    http: Arc<tiny_http::Server>,
    stopping: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.http.unblock();
    }
}

pub struct Srv {
    http: Arc<tiny_http::Server>,
    intake: Arc<Intake>,
    stopping: Arc<AtomicBool>,
}

impl Srv {
    pub fn new(http: tiny_http::Server, intake: Intake) -> Self {
        Srv {
            http: Arc::new(http),
            intake: Arc::new(intake),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            http: Arc::clone(&self.http),
            stopping: Arc::clone(&self.stopping),
        }
    }

    pub fn listen_addr(&self) -> Option<std::net::SocketAddr> {
        self.http.server_addr().to_ip()
    }

    /// Accepts requests until shut down, one thread per request. In-flight
    /// requests are not waited for.
    pub fn run(&self) {
        let listen_addr = self
            .listen_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        log::info!(
            "Serving on '{}' in '{}'.",
            listen_addr,
            self.intake.root_dir().display()
        );

        while !self.stopping.load(Ordering::SeqCst) {
            let req = match self.http.recv() {
                Ok(req) => req,
                Err(e) => {
                    if self.stopping.load(Ordering::SeqCst) {
                        break;
                    }
                    log::warn!("http error: {:?}", e);
                    continue;
                }
            };

            let intake = Arc::clone(&self.intake);
            thread::spawn(move || intake.serve(req));
        }

        log::info!("Stopped accepting requests.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use chrono::{NaiveDate, NaiveDateTime};
    use std::fs;
    use std::io::{self, Write};
    use std::net::{Shutdown, TcpStream};

    fn fixed_time() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 5)
            .unwrap()
            .and_hms_nano_opt(9, 7, 11, 123_456_789)
            .unwrap()
    }

    fn intake(root: &Path, collision: CollisionPolicy) -> Intake {
        Intake::new(root.to_path_buf(), Box::new(FixedClock(fixed_time())), collision)
    }

    fn put(intake: &Intake, url: &str, body: &[u8]) -> Result<LandedFile, Error> {
        intake.handle(&tiny_http::Method::Put, url, &mut io::Cursor::new(body))
    }

    fn is_empty_dir(dir: &Path) -> bool {
        fs::read_dir(dir).unwrap().next().is_none()
    }

    #[test]
    fn test_end_to_end_at_fixed_time() {
        let root = tempfile::tempdir().unwrap();
        let intake = intake(root.path(), CollisionPolicy::Overwrite);

        let landed = put(&intake, "/up?name=test.txt", b"hello").unwrap();

        let work_dir = root.path().join("2024/03/05");
        let expected = work_dir.join("090711.123456789_test.txt");
        assert_eq!(landed.path, expected);
        assert_eq!(landed.size, 5);
        assert_eq!(fs::read(&expected).unwrap(), b"hello");

        let names: Vec<_> = fs::read_dir(&work_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec!["090711.123456789_test.txt"]);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&expected).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o644);
        }
    }

    #[test]
    fn test_percent_encoded_name() {
        let root = tempfile::tempdir().unwrap();
        let intake = intake(root.path(), CollisionPolicy::Overwrite);

        let landed = put(&intake, "/up?name=my%20notes.txt", b"x").unwrap();
        assert!(landed.path.ends_with("2024/03/05/090711.123456789_my notes.txt"));
    }

    #[test]
    fn test_wrong_method() {
        let root = tempfile::tempdir().unwrap();
        let intake = intake(root.path(), CollisionPolicy::Overwrite);

        let err = intake
            .handle(&tiny_http::Method::Get, "/up?name=a", &mut io::empty())
            .unwrap_err();
        assert_eq!(err.as_http_code(), 405);
        assert_eq!(err.msg, "Wrong method.");
        assert!(is_empty_dir(root.path()));
    }

    #[test]
    fn test_missing_name() {
        let root = tempfile::tempdir().unwrap();
        let intake = intake(root.path(), CollisionPolicy::Overwrite);

        for url in ["/up", "/up?name=", "/up?other=a"] {
            let err = put(&intake, url, b"hello").unwrap_err();
            assert_eq!(err.as_http_code(), 400);
            assert_eq!(err.msg, "File name is empty.");
        }
        assert!(is_empty_dir(root.path()));
    }

    #[test]
    fn test_traversal_name() {
        let root = tempfile::tempdir().unwrap();
        let intake = intake(root.path(), CollisionPolicy::Overwrite);

        for url in ["/up?name=../evil", "/up?name=..%2Fevil", "/up?name=a/b"] {
            let err = put(&intake, url, b"hello").unwrap_err();
            assert_eq!(err.as_http_code(), 400);
            assert_eq!(err.msg, "Wrong file name.");
        }
        assert!(is_empty_dir(root.path()));
    }

    #[test]
    fn test_empty_body() {
        let root = tempfile::tempdir().unwrap();
        let intake = intake(root.path(), CollisionPolicy::Overwrite);

        let err = put(&intake, "/up?name=a", b"").unwrap_err();
        assert_eq!(err.as_http_code(), 400);
        assert_eq!(err.msg, "Empty file body.");
        assert!(is_empty_dir(root.path()));
    }

    #[test]
    fn test_unknown_path() {
        let root = tempfile::tempdir().unwrap();
        let intake = intake(root.path(), CollisionPolicy::Overwrite);

        let err = put(&intake, "/down?name=a", b"hello").unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert!(is_empty_dir(root.path()));
    }

    #[test]
    fn test_same_instant_overwrites_by_default() {
        let root = tempfile::tempdir().unwrap();
        let intake = intake(root.path(), CollisionPolicy::Overwrite);

        let first = put(&intake, "/up?name=a", b"first").unwrap();
        let second = put(&intake, "/up?name=a", b"second").unwrap();
        assert_eq!(first.path, second.path);
        assert_eq!(fs::read(&second.path).unwrap(), b"second");
    }

    #[test]
    fn test_same_instant_rejected_with_no_clobber() {
        let root = tempfile::tempdir().unwrap();
        let intake = intake(root.path(), CollisionPolicy::Reject);

        let first = put(&intake, "/up?name=a", b"first").unwrap();
        let err = put(&intake, "/up?name=a", b"second").unwrap_err();
        assert_eq!(err.as_http_code(), 409);
        assert_eq!(fs::read(&first.path).unwrap(), b"first");
    }

    #[test]
    fn test_storage_failure_is_per_request() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("2024"), b"in the way").unwrap();
        let intake = intake(root.path(), CollisionPolicy::Overwrite);

        let err = put(&intake, "/up?name=a", b"hello").unwrap_err();
        assert_eq!(err.as_http_code(), 500);

        fs::remove_file(root.path().join("2024")).unwrap();
        assert!(put(&intake, "/up?name=a", b"hello").is_ok());
    }

    #[test]
    fn test_distinct_days_land_in_distinct_dirs() {
        let root = tempfile::tempdir().unwrap();
        let next_day = NaiveDate::from_ymd_opt(2024, 3, 6)
            .unwrap()
            .and_hms_nano_opt(0, 0, 1, 0)
            .unwrap();
        let today = intake(root.path(), CollisionPolicy::Overwrite);
        let tomorrow = Intake::new(
            root.path().to_path_buf(),
            Box::new(FixedClock(next_day)),
            CollisionPolicy::Overwrite,
        );

        let first = put(&today, "/up?name=a", b"one").unwrap();
        let second = put(&tomorrow, "/up?name=a", b"two").unwrap();

        assert_eq!(first.path, root.path().join("2024/03/05/090711.123456789_a"));
        assert_eq!(second.path, root.path().join("2024/03/06/000001.000000000_a"));
        assert_eq!(fs::read(&first.path).unwrap(), b"one");
        assert_eq!(fs::read(&second.path).unwrap(), b"two");
    }

    fn exchange(addr: std::net::SocketAddr, raw: &str) -> String {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(raw.as_bytes()).unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn test_client_hanging_up_mid_body_lands_nothing() {
        let root = tempfile::tempdir().unwrap();
        let http = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let srv = Srv::new(http, intake(root.path(), CollisionPolicy::Overwrite));
        let addr = srv.listen_addr().unwrap();
        let shutdown = srv.shutdown_handle();
        let running = thread::spawn(move || srv.run());

        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .write_all(
                b"PUT /up?name=cut HTTP/1.1\r\nHost: localhost\r\n\
                  Content-Length: 100000\r\nConnection: close\r\n\r\nabcdef",
            )
            .unwrap();
        stream.shutdown(Shutdown::Write).unwrap();
        // the response only goes out once the landing attempt is over
        let mut resp = String::new();
        let _ = stream.read_to_string(&mut resp);
        drop(stream);

        shutdown.shutdown();
        running.join().unwrap();

        let work_dir = root.path().join("2024/03/05");
        let leftovers: Vec<_> = fs::read_dir(&work_dir)
            .map(|entries| entries.map(|e| e.unwrap().file_name()).collect())
            .unwrap_or_default();
        assert!(leftovers.is_empty(), "{:?}", leftovers);
    }

    #[test]
    fn test_over_the_wire() {
        let root = tempfile::tempdir().unwrap();
        let http = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let srv = Srv::new(http, intake(root.path(), CollisionPolicy::Overwrite));
        let addr = srv.listen_addr().unwrap();
        let shutdown = srv.shutdown_handle();
        let running = thread::spawn(move || srv.run());

        let resp = exchange(
            addr,
            "PUT /up?name=test.txt HTTP/1.1\r\nHost: localhost\r\n\
             Content-Length: 5\r\nConnection: close\r\n\r\nhello",
        );
        assert!(resp.starts_with("HTTP/1.1 200"), "{}", resp);

        let resp = exchange(
            addr,
            "GET /up?name=test.txt HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        );
        assert!(resp.starts_with("HTTP/1.1 405"), "{}", resp);
        assert!(resp.ends_with("Wrong method.\n"), "{}", resp);

        let resp = exchange(
            addr,
            "PUT /up?name=chunked.txt HTTP/1.1\r\nHost: localhost\r\n\
             Transfer-Encoding: chunked\r\nConnection: close\r\n\r\n0\r\n\r\n",
        );
        assert!(resp.starts_with("HTTP/1.1 400"), "{}", resp);
        assert!(resp.ends_with("Empty file body.\n"), "{}", resp);

        shutdown.shutdown();
        running.join().unwrap();

        let work_dir = root.path().join("2024/03/05");
        let names: Vec<_> = fs::read_dir(&work_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec!["090711.123456789_test.txt"]);

        let landed = root.path().join("2024/03/05/090711.123456789_test.txt");
        assert_eq!(fs::read(landed).unwrap(), b"hello");
        assert!(!root.path().join("2024/03/05/090711.123456789_chunked.txt").exists());
    }
}
