//! Signalling state machine, run on the L2CAP receive task.

use super::channel::status;
use super::device::L2capDevice;
use super::signal::{code, result, Signal, REFUSED_DESTINATION_ID, REJECT_NOT_UNDERSTOOD};
use super::L2cap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

impl L2cap {
    /// Drain the signalling channel and act on every command in it.
    pub(super) async fn process_signals(&self, device: &Arc<L2capDevice>) {
        let mut buffer = [0u8; super::device::SIGNAL_BUFFER_LENGTH];
        loop {
            let length = match device.signalling_channel().try_receive(&mut buffer) {
                Ok(Some(length)) => length.min(buffer.len()),
                Ok(None) => break,
                Err(e) => {
                    error!(target: "l2cap", "Failed to receive signal: {}", e);
                    continue;
                }
            };

            match Signal::parse_all(&buffer[..length]) {
                Ok(signals) => {
                    for signal in signals {
                        self.handle_signal(device, signal).await;
                    }
                }
                Err(e) => error!(target: "l2cap", "Malformed signalling packet: {}", e),
            }
        }
    }

    async fn reply(&self, device: &L2capDevice, signal: Signal) {
        // send_signal logs failures
        let _ = self.send_signal(device, signal).await;
    }

    async fn reject(&self, device: &L2capDevice, id: u8) {
        self.reply(device, Signal::command_reject(id, REJECT_NOT_UNDERSTOOD))
            .await;
    }

    async fn handle_signal(&self, device: &Arc<L2capDevice>, signal: Signal) {
        debug!(
            target: "l2cap",
            "Signal {:#04x} id {} {:02X?}",
            signal.code,
            signal.id,
            signal.data
        );

        match signal.code {
            code::REJECT => {
                let reason = signal.word(0).unwrap_or(0);
                match device.channel_expecting(signal.id) {
                    Some(channel) => {
                        error!(
                            target: "l2cap",
                            "Signal {} rejected, reason {:#06x}",
                            signal.id, reason
                        );
                        channel.fail(reason);
                    }
                    None => warn!(target: "l2cap", "Reject for unknown signal {}", signal.id),
                }
            }

            code::CONNECTION_REQUEST => {
                let (Some(psm), Some(scid)) = (signal.word(0), signal.word(2)) else {
                    error!(target: "l2cap", "Connection Request too small");
                    return self.reject(device, signal.id).await;
                };

                let Some(channel) = device.channel_by_protocol(psm).cloned() else {
                    info!(target: "l2cap", "Refusing connection to unsupported psm {:#06x}", psm);
                    return self
                        .reply(
                            device,
                            Signal::connection_response(
                                signal.id,
                                REFUSED_DESTINATION_ID,
                                scid,
                                result::PSM_NOT_SUPPORTED,
                            ),
                        )
                        .await;
                };

                channel.set_destination_id(scid);
                self.reply(
                    device,
                    Signal::connection_response(signal.id, channel.source_id(), scid, result::SUCCESS),
                )
                .await;
                channel.set_flags(status::OPEN);
                debug!(
                    target: "l2cap",
                    "Accepted psm {:#06x}: {:#06x} -> {:#06x}",
                    psm,
                    channel.source_id(),
                    scid
                );

                let id = self.next_signal_id();
                channel.expect_signal(id);
                match Signal::configure_request(id, scid, &[]) {
                    Ok(request) => self.reply(device, request).await,
                    Err(e) => error!(target: "l2cap", "{}", e),
                }
            }

            code::CONNECTION_RESPONSE => {
                let (Some(dcid), Some(scid), Some(outcome)) =
                    (signal.word(0), signal.word(2), signal.word(4))
                else {
                    error!(target: "l2cap", "Connection Response too small");
                    return self.reject(device, signal.id).await;
                };
                if outcome == result::PENDING {
                    debug!(target: "l2cap", "Connection to {:#06x} pending", scid);
                    return;
                }

                let channel = device
                    .channel_expecting(signal.id)
                    .or_else(|| device.channel_by_source(scid))
                    .cloned();
                let Some(channel) = channel else {
                    error!(target: "l2cap", "Connection Response for unknown channel {:#06x}", scid);
                    return;
                };

                if outcome == result::SUCCESS {
                    channel.set_destination_id(dcid);
                    channel.set_flags(status::OPEN);
                } else {
                    info!(
                        target: "l2cap",
                        "Connection for psm {:#06x} refused: {:#06x}",
                        channel.protocol_id(),
                        outcome
                    );
                    channel.fail(outcome);
                }
            }

            code::CONFIGURE_REQUEST => {
                let Some(dcid) = signal.word(0) else {
                    error!(target: "l2cap", "Configuration Request too small");
                    return self.reject(device, signal.id).await;
                };
                let Some(channel) = device.channel_by_source(dcid).cloned() else {
                    error!(target: "l2cap", "Configuration Request for unknown channel {:#06x}", dcid);
                    return self.reject(device, signal.id).await;
                };

                let options = signal.data.get(4..).unwrap_or(&[]);
                self.reply(
                    device,
                    Signal::configure_response(signal.id, channel.destination_id(), options),
                )
                .await;
                channel.set_flags(status::REMOTE_CONFIGURED);
            }

            code::CONFIGURE_RESPONSE => {
                let (Some(scid), Some(outcome)) = (signal.word(0), signal.word(4)) else {
                    error!(target: "l2cap", "Configuration Response too small");
                    return self.reject(device, signal.id).await;
                };
                let channel = device
                    .channel_expecting(signal.id)
                    .or_else(|| device.channel_by_source(scid))
                    .cloned();
                let Some(channel) = channel else {
                    error!(target: "l2cap", "Configuration Response for unknown channel {:#06x}", scid);
                    return;
                };

                if outcome == result::SUCCESS {
                    channel.update_status(|s| {
                        s.flags |= status::LOCAL_CONFIGURED;
                        s.pending_signal = None;
                    });
                } else {
                    error!(target: "l2cap", "Configuration rejected: {:#06x}", outcome);
                    channel.fail(outcome);
                }
            }

            code::DISCONNECTION_REQUEST => {
                let (Some(dcid), Some(scid)) = (signal.word(0), signal.word(2)) else {
                    return self.reject(device, signal.id).await;
                };
                self.reply(device, Signal::disconnection_response(signal.id, dcid, scid))
                    .await;
                if let Some(channel) = device.channel_by_source(dcid) {
                    info!(target: "l2cap", "Peer closed channel {:#06x}", dcid);
                    channel.update_status(|s| s.flags = 0);
                }
            }

            code::DISCONNECTION_RESPONSE => {
                if let Some(channel) = signal.word(2).and_then(|scid| device.channel_by_source(scid)) {
                    channel.update_status(|s| s.flags = 0);
                }
            }

            code::ECHO_REQUEST => {
                self.reply(device, Signal::echo_response(signal.id, &signal.data))
                    .await;
            }

            code::ECHO_RESPONSE | code::INFORMATION_RESPONSE => {
                debug!(target: "l2cap", "Ignoring signal {:#04x}", signal.code);
            }

            code::INFORMATION_REQUEST => {
                let info_type = signal.word(0).unwrap_or(0);
                self.reply(device, Signal::information_response(signal.id, info_type))
                    .await;
            }

            other => {
                error!(target: "l2cap", "Did not handle signal {:#04x}", other);
                self.reject(device, signal.id).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::*;
    use super::*;
    use crate::infrastructure::bluetooth::hci::HciConfig;
    use crate::testing::{signal_packet, FakeController};

    async fn start_with_channel() -> (Arc<FakeController>, Arc<L2cap>, Arc<Channel>) {
        let fake = FakeController::new();
        fake.complete_packets_automatically();
        let hci = Hci::with_device(fake.clone(), HciConfig::default())
            .await
            .unwrap();
        let l2cap = L2cap::initialize(hci, L2capConfig::default()).unwrap();
        let channel = l2cap.initialize_channel(0x0040, 0x0050, 0x11, 256).unwrap();
        l2cap
            .open_device(0x0001, BdAddr::new([1; 6]), vec![channel.clone()])
            .await
            .unwrap();
        (fake, l2cap, channel)
    }

    fn last_signal(fake: &FakeController) -> Signal {
        let sent = fake.sent_acl();
        let last = sent.last().unwrap();
        Signal::parse_all(&last[8..]).unwrap().remove(0)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_information_request_answered() {
        let (fake, l2cap, _channel) = start_with_channel().await;
        fake.push_acl_raw(signal_packet(0x0001, code::INFORMATION_REQUEST, 0x11, &[0x02, 0x00]));
        assert!(fake.wait_for(|f| !f.sent_acl().is_empty()).await);

        let reply = last_signal(&fake);
        assert_eq!(reply.code, code::INFORMATION_RESPONSE);
        assert_eq!(reply.id, 0x11);
        assert_eq!(reply.word(0), Some(0x0002));
        assert_eq!(reply.word(2), Some(0x0000));
        l2cap.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_echo_request_answered() {
        let (fake, l2cap, _channel) = start_with_channel().await;
        fake.push_acl_raw(signal_packet(0x0001, code::ECHO_REQUEST, 0x05, b"ping"));
        assert!(fake.wait_for(|f| !f.sent_acl().is_empty()).await);

        let reply = last_signal(&fake);
        assert_eq!(reply.code, code::ECHO_RESPONSE);
        assert_eq!(reply.data, b"ping".to_vec());
        l2cap.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reject_fails_waiting_channel() {
        let (fake, l2cap, channel) = start_with_channel().await;
        channel.expect_signal(0x33);
        fake.push_acl_raw(signal_packet(0x0001, code::REJECT, 0x33, &[0x02, 0x00]));

        let err = l2cap
            .wait_channel_status(&channel, status::OPEN)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::BtError::SignalFailed(2)));
        l2cap.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_disconnection_request_clears_channel() {
        let (fake, l2cap, channel) = start_with_channel().await;
        channel.set_flags(status::OPEN | status::CONFIGURED);
        fake.push_acl_raw(signal_packet(
            0x0001,
            code::DISCONNECTION_REQUEST,
            0x07,
            &[0x40, 0x00, 0x50, 0x00],
        ));
        assert!(fake.wait_for(|f| !f.sent_acl().is_empty()).await);

        let reply = last_signal(&fake);
        assert_eq!(reply.code, code::DISCONNECTION_RESPONSE);
        assert_eq!(reply.word(0), Some(0x0040));
        assert_eq!(reply.word(2), Some(0x0050));
        assert!(fake.wait_for(|_| channel.flags() == 0).await);
        l2cap.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_refused_connection_response_fails_open() {
        let (fake, l2cap, channel) = start_with_channel().await;
        channel.expect_signal(0x44);
        fake.push_acl_raw(signal_packet(
            0x0001,
            code::CONNECTION_RESPONSE,
            0x44,
            &[0x00, 0x00, 0x40, 0x00, 0x03, 0x00, 0x00, 0x00],
        ));

        let err = l2cap
            .wait_channel_status(&channel, status::OPEN)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::BtError::SignalFailed(3)));
        l2cap.close();
    }
}
