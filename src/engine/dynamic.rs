//! Dynamic Engine Connector
//!
//! Loads an engine adapter from a shared library named
//! `dbqueue_<engine>` (platform prefix/suffix applied) and calls it
//! through a small C ABI:
//!
//! ```text
//! int  dbq_connect(const char *conn, uint32_t timeout, uint64_t *out_conn);
//! int  dbq_prepare(uint64_t conn, const char *name, const char *sql, uint64_t *out_stmt);
//! int  dbq_execute_prepared(uint64_t conn, uint64_t stmt, const char *params_json,
//!                           uint32_t timeout, dbq_result *out);
//! void dbq_unprepare(uint64_t conn, uint64_t stmt);
//! int  dbq_health_check(uint64_t conn);
//! void dbq_disconnect(uint64_t conn);
//! const char *dbq_last_error(uint64_t conn);  /* optional */
//! void dbq_free_string(char *s);              /* optional */
//! ```
//!
//! Every fallible entry point returns 0 on success, 2 on timeout and any
//! other value on failure.

use std::ffi::{CStr, CString, OsString};
use std::os::raw::{c_char, c_int};
use std::path::{Path, PathBuf};
use libloading::Library;

use super::{
    ConnectionConfig, ConnectionHandle, EngineConnector, EngineError, EngineKind, QueryRequest,
    QueryResult, StatementHandle,
};

const DBQ_OK: c_int = 0;
const DBQ_TIMEOUT: c_int = 2;

/// Result block filled in by `dbq_execute_prepared`
#[repr(C)]
struct RawQueryResult {
    row_count: u64,
    affected_rows: u64,
    column_count: u32,
    data_json: *mut c_char,
}

type ConnectFn = unsafe extern "C" fn(*const c_char, u32, *mut u64) -> c_int;
type PrepareFn = unsafe extern "C" fn(u64, *const c_char, *const c_char, *mut u64) -> c_int;
type ExecuteFn = unsafe extern "C" fn(u64, u64, *const c_char, u32, *mut RawQueryResult) -> c_int;
type UnprepareFn = unsafe extern "C" fn(u64, u64);
type HealthCheckFn = unsafe extern "C" fn(u64) -> c_int;
type DisconnectFn = unsafe extern "C" fn(u64);
type LastErrorFn = unsafe extern "C" fn(u64) -> *const c_char;
type FreeStringFn = unsafe extern "C" fn(*mut c_char);

/// Function table resolved from the library
#[derive(Clone, Copy)]
struct EngineApi {
    connect: ConnectFn,
    prepare: PrepareFn,
    execute_prepared: ExecuteFn,
    unprepare: UnprepareFn,
    health_check: HealthCheckFn,
    disconnect: DisconnectFn,
    last_error: Option<LastErrorFn>,
    free_string: Option<FreeStringFn>,
}

/// Connector backed by a dynamically loaded engine library
pub struct DynamicConnector {
    kind: EngineKind,
    path: PathBuf,
    api: EngineApi,
    // Keeps the function table valid; must outlive `api`.
    _library: Library,
}

impl DynamicConnector {
    /// File name of the engine library on this platform
    pub fn library_filename(kind: EngineKind) -> OsString {
        libloading::library_filename(format!("dbqueue_{}", kind.as_str()))
    }

    /// Load the library for `kind`, trying each search directory before
    /// falling back to the system loader path.
    pub fn load(kind: EngineKind, search_paths: &[PathBuf]) -> Result<Self, EngineError> {
        let filename = Self::library_filename(kind);
        let mut candidates: Vec<PathBuf> = search_paths.iter().map(|dir| dir.join(&filename)).collect();
        candidates.push(PathBuf::from(&filename));

        let mut last_error = String::from("no candidate paths");
        for candidate in candidates {
            // Loading runs the library's initializers; engine adapters are trusted code.
            match unsafe { Library::new(&candidate) } {
                Ok(library) => return Self::from_library(kind, candidate, library),
                Err(e) => last_error = format!("{}: {}", candidate.display(), e),
            }
        }

        Err(EngineError::LibraryUnavailable {
            engine: kind,
            reason: last_error,
        })
    }

    fn from_library(kind: EngineKind, path: PathBuf, library: Library) -> Result<Self, EngineError> {
        let missing = |symbol: &str, e: libloading::Error| EngineError::LibraryUnavailable {
            engine: kind,
            reason: format!("{}: missing symbol {}: {}", path.display(), symbol, e),
        };

        // SAFETY: the symbol types match the documented C ABI above.
        let api = unsafe {
            EngineApi {
                connect: *library
                    .get::<ConnectFn>("dbq_connect\0".as_bytes())
                    .map_err(|e| missing("dbq_connect", e))?,
                prepare: *library
                    .get::<PrepareFn>("dbq_prepare\0".as_bytes())
                    .map_err(|e| missing("dbq_prepare", e))?,
                execute_prepared: *library
                    .get::<ExecuteFn>("dbq_execute_prepared\0".as_bytes())
                    .map_err(|e| missing("dbq_execute_prepared", e))?,
                unprepare: *library
                    .get::<UnprepareFn>("dbq_unprepare\0".as_bytes())
                    .map_err(|e| missing("dbq_unprepare", e))?,
                health_check: *library
                    .get::<HealthCheckFn>("dbq_health_check\0".as_bytes())
                    .map_err(|e| missing("dbq_health_check", e))?,
                disconnect: *library
                    .get::<DisconnectFn>("dbq_disconnect\0".as_bytes())
                    .map_err(|e| missing("dbq_disconnect", e))?,
                last_error: library
                    .get::<LastErrorFn>("dbq_last_error\0".as_bytes())
                    .ok()
                    .map(|symbol| *symbol),
                free_string: library
                    .get::<FreeStringFn>("dbq_free_string\0".as_bytes())
                    .ok()
                    .map(|symbol| *symbol),
            }
        };

        log::debug!("Loaded {} engine library from {}", kind, path.display());

        Ok(Self {
            kind,
            path,
            api,
            _library: library,
        })
    }

    /// Path the library was loaded from
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn last_error(&self, connection: u64) -> String {
        let Some(last_error) = self.api.last_error else {
            return "unknown engine error".to_string();
        };

        // SAFETY: the library returns NULL or a NUL-terminated string it owns.
        unsafe {
            let message = last_error(connection);
            if message.is_null() {
                "unknown engine error".to_string()
            } else {
                CStr::from_ptr(message).to_string_lossy().into_owned()
            }
        }
    }

    fn check_engine(&self, connection: ConnectionHandle) -> Result<(), EngineError> {
        if connection.engine() != self.kind {
            return Err(EngineError::Execute(format!(
                "{} connection handed to {} connector",
                connection.engine(),
                self.kind
            )));
        }
        Ok(())
    }
}

fn c_string(value: &str, what: &str) -> Result<CString, EngineError> {
    CString::new(value).map_err(|_| EngineError::Execute(format!("{} contains a NUL byte", what)))
}

impl EngineConnector for DynamicConnector {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    fn connect(&self, config: &ConnectionConfig) -> Result<ConnectionHandle, EngineError> {
        let conn_str = CString::new(config.connection_string.as_str()).map_err(|_| {
            EngineError::InvalidConnectionString("connection string contains a NUL byte".to_string())
        })?;

        let mut raw = 0u64;
        // SAFETY: pointers are valid for the duration of the call.
        let rc = unsafe { (self.api.connect)(conn_str.as_ptr(), config.timeout_seconds, &mut raw) };
        match rc {
            DBQ_OK => Ok(ConnectionHandle::new(self.kind, raw)),
            DBQ_TIMEOUT => Err(EngineError::Timeout(config.timeout_seconds)),
            _ => Err(EngineError::Connect(self.last_error(0))),
        }
    }

    fn prepare(
        &self,
        connection: ConnectionHandle,
        name: &str,
        sql: &str,
    ) -> Result<StatementHandle, EngineError> {
        self.check_engine(connection)?;
        let name_c = CString::new(name).map_err(|_| EngineError::Prepare {
            name: name.to_string(),
            reason: "name contains a NUL byte".to_string(),
        })?;
        let sql_c = CString::new(sql).map_err(|_| EngineError::Prepare {
            name: name.to_string(),
            reason: "SQL contains a NUL byte".to_string(),
        })?;

        let mut raw = 0u64;
        // SAFETY: pointers are valid for the duration of the call.
        let rc = unsafe {
            (self.api.prepare)(connection.raw(), name_c.as_ptr(), sql_c.as_ptr(), &mut raw)
        };
        if rc == DBQ_OK {
            Ok(StatementHandle::new(raw))
        } else {
            Err(EngineError::Prepare {
                name: name.to_string(),
                reason: self.last_error(connection.raw()),
            })
        }
    }

    fn execute_prepared(
        &self,
        connection: ConnectionHandle,
        statement: StatementHandle,
        request: &QueryRequest,
    ) -> Result<QueryResult, EngineError> {
        self.check_engine(connection)?;
        let params = c_string(&request.parameters_json, "parameters")?;

        let mut raw = RawQueryResult {
            row_count: 0,
            affected_rows: 0,
            column_count: 0,
            data_json: std::ptr::null_mut(),
        };
        // SAFETY: pointers are valid for the duration of the call.
        let rc = unsafe {
            (self.api.execute_prepared)(
                connection.raw(),
                statement.raw(),
                params.as_ptr(),
                request.timeout_seconds,
                &mut raw,
            )
        };

        let data_json = if raw.data_json.is_null() {
            None
        } else {
            // SAFETY: the library hands over a NUL-terminated string; we give it back.
            unsafe {
                let data = CStr::from_ptr(raw.data_json).to_string_lossy().into_owned();
                if let Some(free_string) = self.api.free_string {
                    free_string(raw.data_json);
                }
                Some(data)
            }
        };

        match rc {
            DBQ_OK => Ok(QueryResult {
                data_json,
                row_count: raw.row_count,
                column_count: raw.column_count,
                affected_rows: raw.affected_rows,
            }),
            DBQ_TIMEOUT => Err(EngineError::Timeout(request.timeout_seconds)),
            _ => Err(EngineError::Execute(self.last_error(connection.raw()))),
        }
    }

    fn unprepare(&self, connection: ConnectionHandle, statement: StatementHandle) {
        if self.check_engine(connection).is_err() {
            return;
        }
        // SAFETY: plain integer arguments.
        unsafe { (self.api.unprepare)(connection.raw(), statement.raw()) }
    }

    fn health_check(&self, connection: ConnectionHandle) -> bool {
        if self.check_engine(connection).is_err() {
            return false;
        }
        // SAFETY: plain integer argument.
        unsafe { (self.api.health_check)(connection.raw()) == DBQ_OK }
    }

    fn disconnect(&self, connection: ConnectionHandle) {
        if self.check_engine(connection).is_err() {
            return;
        }
        // SAFETY: plain integer argument.
        unsafe { (self.api.disconnect)(connection.raw()) }
    }
}
