//! The UART link to the companion synthesizer, with every MIDI message mirrored to USB.

use bartleby_lib::{TransportError, link::Transport};
use defmt::{trace, warn};
use embassy_stm32::usart::BufferedUart;
use embassy_sync::{
    blocking_mutex::raw::CriticalSectionRawMutex,
    channel::{Channel, Receiver, Sender},
};
use embassy_time::{Duration, Instant};
use embedded_io::{Read, ReadReady, Write};
use wmidi::MidiMessage;

/// A USB-MIDI event packet: cable/code-index byte followed by up to three MIDI bytes.
pub type UsbMidiPacket = [u8; 4];

const USB_MIDI_QUEUE_DEPTH: usize = 32;

/// Queues MIDI for the USB task.
pub static USB_MIDI: Channel<CriticalSectionRawMutex, UsbMidiPacket, USB_MIDI_QUEUE_DEPTH> =
    Channel::new();
pub type UsbMidiSender<'a> =
    Sender<'a, CriticalSectionRawMutex, UsbMidiPacket, USB_MIDI_QUEUE_DEPTH>;
pub type UsbMidiReceiver<'a> =
    Receiver<'a, CriticalSectionRawMutex, UsbMidiPacket, USB_MIDI_QUEUE_DEPTH>;

/// Longest time spent discarding inbound bytes; a remote device that never stops talking cannot hold up the loop.
const FLUSH_DEADLINE: Duration = Duration::from_millis(100);

/// [`Transport`] over the shared UART.
pub struct UartLink {
    uart: BufferedUart<'static>,
    usb: UsbMidiSender<'static>,
}

impl UartLink {
    pub fn new(uart: BufferedUart<'static>, usb: UsbMidiSender<'static>) -> Self {
        Self { uart, usb }
    }

    /// Hands a copy of `bytes` to the USB task. When the host isn't draining the queue, the copy is dropped.
    fn mirror(&self, bytes: &[u8]) {
        let Some(&status) = bytes.first() else {
            return;
        };
        let mut packet = [0; 4];
        // cable 0; for channel messages the code index is the status nibble
        packet[0] = status >> 4;
        packet[1..=bytes.len()].copy_from_slice(bytes);

        if self.usb.try_send(packet).is_err() {
            trace!("USB MIDI queue full, dropping {}", packet);
        }
    }
}

impl Transport for UartLink {
    fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.uart.write_all(bytes).map_err(|e| {
            warn!("UART write failed: {}", e);
            TransportError::Write
        })
    }

    fn receive_available_bytes(&mut self, buffer: &mut [u8]) -> Result<usize, TransportError> {
        let ready = self.uart.read_ready().map_err(|_| TransportError::Read)?;
        if !ready || buffer.is_empty() {
            return Ok(0);
        }
        self.uart.read(buffer).map_err(|e| {
            warn!("UART read failed: {}", e);
            TransportError::Read
        })
    }

    fn flush_input(&mut self) {
        let deadline = Instant::now() + FLUSH_DEADLINE;
        let mut scratch = [0; 64];
        let mut discarded = 0;

        while Instant::now() < deadline {
            match self.uart.read_ready() {
                Ok(true) => match self.uart.read(&mut scratch) {
                    Ok(n) => discarded += n,
                    Err(_) => break,
                },
                _ => break,
            }
        }
        trace!("Flushed {} inbound bytes", discarded);
    }

    fn send_midi(&mut self, message: &MidiMessage<'_>) -> Result<(), TransportError> {
        let mut bytes = [0; 3];
        let len = message
            .copy_to_slice(&mut bytes)
            .map_err(|_| TransportError::Encode)?;
        self.send_bytes(&bytes[..len])?;
        self.mirror(&bytes[..len]);
        Ok(())
    }
}
