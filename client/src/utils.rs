use uuid::Uuid;

use crate::constants::{ROOM_CODE_ALPHABET, ROOM_CODE_LEN};

/// Generate a short room code from the alphanumeric alphabet
pub fn generate_room_code() -> String {
    let mut raw = Uuid::new_v4().as_u128();
    let base = ROOM_CODE_ALPHABET.len() as u128;
    (0..ROOM_CODE_LEN)
        .map(|_| {
            let ch = ROOM_CODE_ALPHABET[(raw % base) as usize] as char;
            raw /= base;
            ch
        })
        .collect()
}

/// Format seconds into MM:SS.mmm or HH:MM:SS.mmm
pub fn format_time(seconds: f64) -> String {
    let total_millis = (seconds.max(0.0) * 1000.0).round() as u64;
    let total_secs = total_millis / 1000;
    let millis = total_millis % 1000;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{:02}:{:02}:{:02}.{:03}", hours, minutes, secs, millis)
    } else {
        format!("{:02}:{:02}.{:03}", minutes, secs, millis)
    }
}
