//! The special-key byte table for `POST /api/sessions/{id}/input`'s `key`
//! field. This mapping is a wire contract: clients (dashboards, CLIs) encode
//! a key name and expect it to be reproduced byte-for-byte on the PTY's
//! stdin, so nothing here may be "improved" without breaking callers.

pub fn key_to_bytes(key: &str) -> Option<&'static [u8]> {
    Some(match key {
        "enter" => b"\r",
        "tab" => b"\t",
        "escape" => b"\x1b",
        "backspace" => b"\x7f",
        "arrow_up" => b"\x1b[A",
        "arrow_down" => b"\x1b[B",
        "arrow_right" => b"\x1b[C",
        "arrow_left" => b"\x1b[D",
        "ctrl_a" => b"\x01",
        "ctrl_b" => b"\x02",
        "ctrl_c" => b"\x03",
        "ctrl_d" => b"\x04",
        "ctrl_e" => b"\x05",
        "ctrl_f" => b"\x06",
        "ctrl_g" => b"\x07",
        "ctrl_h" => b"\x08",
        "ctrl_i" => b"\x09",
        "ctrl_j" => b"\x0a",
        "ctrl_k" => b"\x0b",
        "ctrl_l" => b"\x0c",
        "ctrl_m" => b"\x0d",
        "ctrl_n" => b"\x0e",
        "ctrl_o" => b"\x0f",
        "ctrl_p" => b"\x10",
        "ctrl_q" => b"\x11",
        "ctrl_r" => b"\x12",
        "ctrl_s" => b"\x13",
        "ctrl_t" => b"\x14",
        "ctrl_u" => b"\x15",
        "ctrl_v" => b"\x16",
        "ctrl_w" => b"\x17",
        "ctrl_x" => b"\x18",
        "ctrl_y" => b"\x19",
        "ctrl_z" => b"\x1a",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_core_keys_byte_for_byte() {
        assert_eq!(key_to_bytes("enter"), Some(&b"\r"[..]));
        assert_eq!(key_to_bytes("tab"), Some(&b"\t"[..]));
        assert_eq!(key_to_bytes("escape"), Some(&b"\x1b"[..]));
        assert_eq!(key_to_bytes("backspace"), Some(&b"\x7f"[..]));
        assert_eq!(key_to_bytes("arrow_up"), Some(&b"\x1b[A"[..]));
        assert_eq!(key_to_bytes("arrow_down"), Some(&b"\x1b[B"[..]));
        assert_eq!(key_to_bytes("arrow_right"), Some(&b"\x1b[C"[..]));
        assert_eq!(key_to_bytes("arrow_left"), Some(&b"\x1b[D"[..]));
    }

    #[test]
    fn maps_ctrl_range() {
        assert_eq!(key_to_bytes("ctrl_a"), Some(&[0x01u8][..]));
        assert_eq!(key_to_bytes("ctrl_z"), Some(&[0x1au8][..]));
    }

    #[test]
    fn unknown_key_is_none() {
        assert_eq!(key_to_bytes("shift_enter"), None);
        assert_eq!(key_to_bytes(""), None);
    }
}
