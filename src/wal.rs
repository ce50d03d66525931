use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Frames larger than this are treated as corruption rather than allocated.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

fn encode_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "WAL frame too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read exactly `buf.len()` bytes. `Ok(false)` means the file ended first.
fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

enum Frame {
    /// An intact event and the bytes its frame occupies.
    Event(Box<Event>, u64),
    /// Clean end of file.
    End,
    /// Torn or corrupt tail; everything from here on is ignored.
    Damaged(&'static str),
}

fn decode_frame(reader: &mut impl Read) -> io::Result<Frame> {
    let mut len_buf = [0u8; 4];
    if !read_or_eof(reader, &mut len_buf)? {
        return Ok(Frame::End);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(Frame::Damaged("length prefix out of range"));
    }

    let mut payload = vec![0u8; len];
    if !read_or_eof(reader, &mut payload)? {
        return Ok(Frame::Damaged("truncated payload"));
    }
    let mut crc_buf = [0u8; 4];
    if !read_or_eof(reader, &mut crc_buf)? {
        return Ok(Frame::Damaged("truncated checksum"));
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Frame::Damaged("checksum mismatch"));
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Frame::Event(Box::new(event), 8 + len as u64)),
        Err(_) => Ok(Frame::Damaged("undecodable payload")),
    }
}

/// Append-only write-ahead log of scheduling events.
///
/// Each entry is `[u32 len][bincode Event][u32 crc32]`, little-endian, where
/// `len` covers the payload only. A torn tail from a crash is dropped on replay.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append and fsync one event. Production goes through the group-commit
    /// pair `append_buffered` + `flush_sync`.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event without syncing.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_frame(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write the compacted event set to a side file and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_tmp_path(path))?);
        for event in events {
            encode_frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the side file over the log and reopen for appending.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Every intact event in order. A missing file replays as empty.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(Self::scan(path)?.events)
    }

    /// Replay, then cut any damaged tail off the file so later appends land
    /// directly after the last intact frame.
    pub fn recover(path: &Path) -> io::Result<Vec<Event>> {
        let scan = Self::scan(path)?;
        if scan.damaged {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(scan.intact_len)?;
            file.sync_all()?;
            tracing::warn!(
                path = %path.display(),
                intact_len = scan.intact_len,
                "truncated damaged WAL tail"
            );
        }
        Ok(scan.events)
    }

    fn scan(path: &Path) -> io::Result<Scan> {
        let mut scan = Scan {
            events: Vec::new(),
            intact_len: 0,
            damaged: false,
        };
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(scan),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        loop {
            match decode_frame(&mut reader)? {
                Frame::Event(event, frame_len) => {
                    scan.events.push(*event);
                    scan.intact_len += frame_len;
                }
                Frame::End => break,
                Frame::Damaged(reason) => {
                    tracing::warn!(
                        path = %path.display(),
                        recovered = scan.events.len(),
                        reason,
                        "discarding damaged WAL tail"
                    );
                    scan.damaged = true;
                    break;
                }
            }
        }
        Ok(scan)
    }
}

struct Scan {
    events: Vec<Event>,
    /// Byte length of the intact prefix.
    intact_len: u64,
    damaged: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Booking, BookingStatus};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("baybook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn bay_created(key: &str) -> Event {
        Event::BayCreated {
            id: Ulid::new(),
            key: key.into(),
            name: format!("Bay {key}"),
            at: 1_000,
        }
    }

    fn booking_created(bay_id: Ulid, number: u64) -> Event {
        Event::BookingCreated {
            booking: Booking {
                id: Ulid::new(),
                number,
                bay_id,
                vehicle_id: "unit-7".into(),
                company_id: Some("acme".into()),
                technician_ids: vec!["t1".into()],
                start: 10_000,
                end: None,
                status: BookingStatus::Open,
                title: "Brakes".into(),
                complaint: "grinding".into(),
                description: String::new(),
                notes: String::new(),
                service_ref: String::new(),
                created_by: None,
                created_at: 1_000,
                updated_at: 1_000,
            },
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let bay = bay_created("B1");
        let Event::BayCreated { id, .. } = &bay else { unreachable!() };
        let events = vec![bay.clone(), booking_created(*id, 1)];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_drops_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        let event = bay_created("B1");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_bad_checksum() {
        let path = tmp_path("bad_crc.wal");
        let good = bay_created("B1");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&bay_created("B2")).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_truncates_damage_so_later_appends_survive() {
        let path = tmp_path("recover.wal");
        let good = bay_created("B1");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        let intact = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }

        assert_eq!(Wal::recover(&path).unwrap(), vec![good.clone()]);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact);

        let late = bay_created("B3");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&late).unwrap();
        }
        assert_eq!(Wal::recover(&path).unwrap(), vec![good, late]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_leaves_clean_file_alone() {
        let path = tmp_path("recover_clean.wal");
        assert!(Wal::recover(&path).unwrap().is_empty());
        assert!(!path.exists());

        let event = bay_created("B1");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        let len = fs::metadata(&path).unwrap().len();
        assert_eq!(Wal::recover(&path).unwrap(), vec![event]);
        assert_eq!(fs::metadata(&path).unwrap().len(), len);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_rejects_absurd_length_prefix() {
        let path = tmp_path("huge_len.wal");
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
            f.write_all(&[0u8; 32]).unwrap();
        }
        assert!(Wal::replay(&path).unwrap().is_empty());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let bay = bay_created("B1");
        let Event::BayCreated { id, .. } = &bay else { unreachable!() };
        let bay_id = *id;

        let mut wal = Wal::open(&path).unwrap();
        wal.append(&bay).unwrap();
        for n in 1..=20 {
            let created = booking_created(bay_id, n);
            let Event::BookingCreated { booking } = &created else { unreachable!() };
            wal.append(&created).unwrap();
            wal.append(&Event::BookingDeleted { id: booking.id, bay_id }).unwrap();
        }
        assert_eq!(wal.appends_since_compact(), 41);
        let before = fs::metadata(&path).unwrap().len();

        let compacted = vec![Event::NumberSeries { next: 21 }, bay.clone()];
        wal.compact(&compacted).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        assert!(fs::metadata(&path).unwrap().len() < before);

        let late = booking_created(bay_id, 21);
        wal.append(&late).unwrap();
        drop(wal);

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![compacted[0].clone(), bay, late]);
        let _ = fs::remove_file(&path);
    }
}
