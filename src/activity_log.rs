// starnet-node - self-organizing UDP star overlay for peer discovery,
// RTT-based hub election, and broadcast relay.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Persistent activity log, `<name>-log.log`.

use std::path::PathBuf;

use chrono::Utc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Append-only, UTC-timestamped diagnostic trail, mirrored into the
/// ordinary `log` stream so both the file and stderr carry the same
/// record.
pub struct ActivityLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ActivityLog {
    pub fn new(self_name: &str) -> Self {
        Self {
            path: PathBuf::from(format!("{self_name}-log.log")),
            lock: Mutex::new(()),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_in(dir: &std::path::Path, self_name: &str) -> Self {
        Self {
            path: dir.join(format!("{self_name}-log.log")),
            lock: Mutex::new(()),
        }
    }

    /// Appends one line, stamped `YYYY-MM-DD HH:MM:SS` UTC.
    pub async fn append(&self, message: &str) {
        let _guard = self.lock.lock().await;
        let line = format!("{} {}\n", Utc::now().format("%Y-%m-%d %H:%M:%S"), message);
        log::info!("{message}");

        let file = OpenOptions::new().create(true).append(true).open(&self.path).await;
        match file {
            Ok(mut file) => {
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    log::warn!("activity log: write failed: {e}");
                }
            }
            Err(e) => log::warn!("activity log: open failed: {e}"),
        }
    }

    /// Returns the full current log contents, for the `show-log` command.
    pub async fn read_all(&self) -> String {
        let _guard = self.lock.lock().await;
        tokio::fs::read_to_string(&self.path).await.unwrap_or_default()
    }
}
