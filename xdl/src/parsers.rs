// SPDX-License-Identifier: BSD-3-Clause

use indexmap::IndexMap;

use crate::error::{ProtocolError, Result};
use crate::firehose::{
    FH_PROTO_VERSION_SUPPORTED, attr_parse, firehose_configure, firehose_read, rejected,
};
use crate::types::{FirehoseResetMode, FirehoseStatus, QcomChan};

// Parsers are kept separate for more flexibility (e.g. log replay analysis)

/// Check "value" for ack/nak (generic)
pub fn firehose_parser_ack_nak<T: QcomChan + ?Sized>(
    _: &mut T,
    attrs: &IndexMap<String, String>,
) -> Result<FirehoseStatus> {
    match attrs.get("value").map(String::as_str) {
        Some("ACK") => Ok(FirehoseStatus::Ack),
        Some("NAK") => Ok(FirehoseStatus::Nak),
        _ => Err(ProtocolError::UnexpectedResponse {
            phase: "firehose response".into(),
            detail: format!("no usable 'value' in {attrs:?}"),
        }
        .into()),
    }
}

/// Parse the `<configure>` response and finish the buffer-size negotiation.
pub fn firehose_parser_configure_response<T: QcomChan + ?Sized>(
    channel: &mut T,
    attrs: &IndexMap<String, String>,
) -> Result<FirehoseStatus> {
    if firehose_parser_ack_nak(channel, attrs)? == FirehoseStatus::Nak {
        // The device can't handle that big of a buffer and auto-reconfigures
        // to the max it can
        if let Some(val) = attrs.get("MaxPayloadSizeToTargetInBytes") {
            channel.mut_fh_config().send_buffer_size =
                attr_parse(attrs, "MaxPayloadSizeToTargetInBytes", "configure")?;
            tracing::debug!(accepted = val.as_str(), "device shrank the send buffer");
        } else {
            let _ = crate::firehose::firehose_reset(channel, FirehoseResetMode::ResetToEdl, 0);
            return Err(rejected(&["<configure> NAKed with no counteroffer".into()]));
        }
    }

    let device_max_write_payload_size: usize =
        attr_parse(attrs, "MaxPayloadSizeToTargetInBytesSupported", "configure")?;

    let version: u32 = attr_parse(attrs, "Version", "configure")?;
    let min_version_supported: u32 = attr_parse(attrs, "MinVersionSupported", "configure")?;
    tracing::info!(version, "firehose protocol version");
    if min_version_supported > FH_PROTO_VERSION_SUPPORTED {
        return Err(ProtocolError::VersionUnsupported {
            device_version: min_version_supported,
        }
        .into());
    }
    channel.mut_device_info().firehose_version = Some(version);

    if let Some(xml_size) = attrs.get("MaxXMLSizeInBytes") {
        channel.mut_fh_config().xml_buf_size = xml_size.parse().unwrap_or(4096);
    }
    if attrs.contains_key("MaxPayloadSizeToTargetInBytes") {
        channel.mut_fh_config().send_buffer_size =
            attr_parse(attrs, "MaxPayloadSizeToTargetInBytes", "configure")?;
    }

    // If the device can take a larger buffer, reconfigure it.
    if channel.fh_config().send_buffer_size < device_max_write_payload_size {
        tracing::info!(
            "reconfiguring the device to use a larger ({} kB) send buffer",
            device_max_write_payload_size / 1024
        );

        channel.mut_fh_config().send_buffer_size = device_max_write_payload_size;
        firehose_configure(channel, false)?;
        firehose_read(channel, firehose_parser_ack_nak)?;
    }
    let negotiated = channel.fh_config().send_buffer_size as u64;
    channel.mut_device_info().max_download_size = Some(negotiated);

    Ok(FirehoseStatus::Ack)
}
