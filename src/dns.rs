//! Captive name-resolution responder.
//!
//! While the portal is active every A query is answered with the hub's own
//! address, so arbitrary probe hosts end up at the portal server.

use anyhow::{Context, Result};
use log::{debug, info};
use std::net::Ipv4Addr;
use tokio::net::UdpSocket;

const HEADER_LEN: usize = 12;
const TYPE_A: u16 = 1;
const TYPE_ANY: u16 = 255;
const CLASS_IN: u16 = 1;
const ANSWER_TTL_SECS: u32 = 60;

/// Answer queries on `socket` until receiving fails
pub async fn serve(socket: UdpSocket, address: Ipv4Addr) -> Result<()> {
    info!(
        "dns responder listening on {}",
        socket.local_addr().context("failed to get dns address")?
    );

    let mut buffer = [0u8; 512];

    loop {
        let (len, peer) = socket
            .recv_from(&mut buffer)
            .await
            .context("failed to receive dns query")?;

        let Some(response) = answer(&buffer[..len], address) else {
            debug!("ignoring malformed dns packet from {peer}");
            continue;
        };

        if let Err(e) = socket.send_to(&response, peer).await {
            debug!("failed to answer dns query from {peer}: {e}");
        }
    }
}

/// Build the response to a single-question query
///
/// # Returns
/// `None` for responses, non-standard queries and truncated packets
pub fn answer(query: &[u8], address: Ipv4Addr) -> Option<Vec<u8>> {
    if query.len() < HEADER_LEN {
        return None;
    }

    let flags = u16::from_be_bytes([query[2], query[3]]);
    let is_response = flags & 0x8000 != 0;
    let opcode = (flags >> 11) & 0x0f;
    let question_count = u16::from_be_bytes([query[4], query[5]]);

    if is_response || opcode != 0 || question_count == 0 {
        return None;
    }

    let question_end = question_end(query)?;
    let question_type = u16::from_be_bytes([query[question_end - 4], query[question_end - 3]]);
    let question_class = u16::from_be_bytes([query[question_end - 2], query[question_end - 1]]);
    let answers: u16 =
        if matches!(question_type, TYPE_A | TYPE_ANY) && question_class == CLASS_IN {
            1
        } else {
            0
        };

    let mut response = Vec::with_capacity(question_end + 16);
    response.extend_from_slice(&query[0..2]);
    // response, authoritative, recursion desired copied from query
    response.extend_from_slice(&(0x8400 | (flags & 0x0100)).to_be_bytes());
    response.extend_from_slice(&1u16.to_be_bytes());
    response.extend_from_slice(&answers.to_be_bytes());
    response.extend_from_slice(&0u16.to_be_bytes());
    response.extend_from_slice(&0u16.to_be_bytes());
    response.extend_from_slice(&query[HEADER_LEN..question_end]);

    if answers == 1 {
        // pointer to the name of the first question
        response.extend_from_slice(&0xc00cu16.to_be_bytes());
        response.extend_from_slice(&TYPE_A.to_be_bytes());
        response.extend_from_slice(&CLASS_IN.to_be_bytes());
        response.extend_from_slice(&ANSWER_TTL_SECS.to_be_bytes());
        response.extend_from_slice(&4u16.to_be_bytes());
        response.extend_from_slice(&address.octets());
    }

    Some(response)
}

/// Offset just past type and class of the first question
fn question_end(query: &[u8]) -> Option<usize> {
    let mut offset = HEADER_LEN;

    loop {
        let len = usize::from(*query.get(offset)?);
        offset += 1;

        if len == 0 {
            break;
        }

        // compressed names are not valid in a question
        if len & 0xc0 != 0 {
            return None;
        }

        offset += len;
    }

    let end = offset + 4;
    (end <= query.len()).then_some(end)
}
