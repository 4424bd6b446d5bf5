//! One recording session of a channel.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

const ID_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

#[derive(Debug, Clone, Serialize)]
pub struct Episode {
    pub id: String,
    pub started_at: DateTime<Utc>,
    /// `None` while the episode is being recorded.
    pub ended_at: Option<DateTime<Utc>>,
    pub directory: PathBuf,
}

impl Episode {
    /// Open an episode starting at `now` inside `channel_dir`.
    ///
    /// The id is the timestamp; `taken` reports ids already in use, which
    /// get a `-N` suffix.
    pub(crate) fn open(channel_dir: &Path, now: DateTime<Utc>, taken: impl Fn(&str) -> bool) -> Self {
        let base = now.format(ID_FORMAT).to_string();
        let mut id = base.clone();
        let mut n = 1;
        while taken(&id) {
            id = format!("{base}-{n}");
            n += 1;
        }
        Self {
            directory: channel_dir.join(&id),
            id,
            started_at: now,
            ended_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    pub(crate) fn close(&mut self, now: DateTime<Utc>) {
        if self.ended_at.is_none() {
            self.ended_at = Some(now);
        }
    }
}

/// A minimal page playing the recording in a browser.
pub(crate) fn player_page(playlist: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<body>
<video width="640" height="360" controls autoplay>
  <source src="{playlist}" type="application/vnd.apple.mpegurl" />
  Your browser does not support the video tag.
</video>
</body>
</html>
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn id_is_timestamp_with_collision_suffix() {
        let now = Utc.with_ymd_and_hms(2012, 3, 4, 5, 6, 7).unwrap();
        let first = Episode::open(Path::new("/data/bus"), now, |_| false);
        assert_eq!(first.id, "2012-03-04_05-06-07");
        assert_eq!(first.directory, PathBuf::from("/data/bus/2012-03-04_05-06-07"));

        let second = Episode::open(Path::new("/data/bus"), now, |id| {
            id == "2012-03-04_05-06-07" || id == "2012-03-04_05-06-07-1"
        });
        assert_eq!(second.id, "2012-03-04_05-06-07-2");
    }

    #[test]
    fn close_is_final() {
        let start = Utc.with_ymd_and_hms(2012, 3, 4, 5, 6, 7).unwrap();
        let mut episode = Episode::open(Path::new("/d"), start, |_| false);
        assert!(episode.is_open());
        let end = start + chrono::Duration::seconds(60);
        episode.close(end);
        episode.close(end + chrono::Duration::seconds(5));
        assert_eq!(episode.ended_at, Some(end));
        assert!(!episode.is_open());
    }
}
