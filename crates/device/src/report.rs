//! Output report framing and the HID class SET_REPORT request.

use transport_usb::ControlSetup;

/// Host-to-device, class request, interface recipient.
pub const HID_REQUEST_TYPE_OUT: u8 = 0x21;
pub const HID_SET_REPORT: u8 = 0x09;
pub const HID_REPORT_TYPE_OUTPUT: u8 = 0x02;

/// Report id 0 means the device uses no report ids: the payload goes out bare.
pub fn output_report(report_id: u8, payload: &[u8]) -> Vec<u8> {
    if report_id == 0 {
        return payload.to_vec();
    }
    let mut report = Vec::with_capacity(payload.len() + 1);
    report.push(report_id);
    report.extend_from_slice(payload);
    report
}

pub fn set_report_setup(report_id: u8, interface: u8) -> ControlSetup {
    ControlSetup {
        request_type: HID_REQUEST_TYPE_OUT,
        request: HID_SET_REPORT,
        value: (u16::from(HID_REPORT_TYPE_OUTPUT) << 8) | u16::from(report_id),
        index: u16::from(interface),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonzero_report_id_is_prefixed() {
        assert_eq!(output_report(5, &[0x01, 0x02]), vec![0x05, 0x01, 0x02]);
    }

    #[test]
    fn zero_report_id_sends_payload_unchanged() {
        assert_eq!(output_report(0, &[0x01, 0x02]), vec![0x01, 0x02]);
        assert!(output_report(0, &[]).is_empty());
    }

    #[test]
    fn set_report_setup_encodes_output_type_and_interface() {
        let s = set_report_setup(0x05, 2);
        assert_eq!(s.request_type, 0x21);
        assert_eq!(s.request, 0x09);
        assert_eq!(s.value, 0x0205);
        assert_eq!(s.index, 2);
    }
}
