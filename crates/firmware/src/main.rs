//! Bartleby is [Embassy](https://embassy.dev)-based firmware for a split-keyboard
//! [MPE](https://midi.org/mpe-midi-polyphonic-expression) controller. Each of its 25 keys senses pressure and
//! lateral position, and the player's gestures travel as per-note channel pressure and pitch bend over a serial
//! line shared with a companion synthesizer. The firmware runs on the [Nucleo-F767ZI development
//! board](https://www.st.com/en/evaluation-tools/nucleo-f767zi.html).
//!
//! Everything with algorithmic content (the link protocol, channel allocation, note lifecycle, event ordering,
//! and sensor math) lives in `bartleby_lib`, where it can be tested on the host. This crate wires that library to
//! the board's pins and peripherals and runs its control loop.

#![no_std]
#![no_main]

mod link;
mod panel;

use crate::{
    link::{USB_MIDI, UartLink, UsbMidiReceiver},
    panel::{Mux, Panel},
};
use bartleby_lib::{
    Error,
    configuration::{CycleConfig, ResponseCurve, Settings},
    controller::Bartleby,
    link::BAUD_RATE,
};
use defmt::{panic, *};
use embassy_executor::Spawner;
use embassy_stm32::{
    Config, Peri, bind_interrupts,
    adc::{Adc, AdcChannel},
    exti::ExtiInput,
    gpio::{AnyPin, Input, Level, Output, Pull, Speed},
    peripherals,
    time::Hertz,
    usart::{self, BufferedUart},
    usb,
};
use embassy_sync::{
    blocking_mutex::raw::CriticalSectionRawMutex,
    watch::{Receiver, Sender, Watch},
};
use embassy_time::{Instant, Ticker, Timer};
use embassy_usb::{Builder, UsbDevice, class::midi::MidiClass, driver::EndpointError};
use static_cell::StaticCell;

use {defmt_rtt as _, panic_probe as _};

bind_interrupts!(
    #[doc(hidden)]
    struct Irqs {
        OTG_FS => usb::InterruptHandler<peripherals::USB_OTG_FS>;
        USART2 => usart::BufferedInterruptHandler<peripherals::USART2>;
    }
);

type UsbDriver = usb::Driver<'static, peripherals::USB_OTG_FS>;
type Controller = Bartleby<UartLink, Panel>;

const PRESSURE_CURVE_RECEIVER_CNT: usize = 2;
/// Syncs the player's pressure curve selection across tasks.
static PRESSURE_CURVE_SYNC: Watch<
    CriticalSectionRawMutex,
    ResponseCurve,
    PRESSURE_CURVE_RECEIVER_CNT,
> = Watch::new_with(ResponseCurve::Linear);
type PressureCurveSender<'a> =
    Sender<'a, CriticalSectionRawMutex, ResponseCurve, PRESSURE_CURVE_RECEIVER_CNT>;
type PressureCurveReceiver<'a> =
    Receiver<'a, CriticalSectionRawMutex, ResponseCurve, PRESSURE_CURVE_RECEIVER_CNT>;

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("Initializing Bartleby");

    let mut config = Config::default();
    {
        use embassy_stm32::rcc::*;
        // hse: high-speed external clock
        config.rcc.hse = Some(Hse {
            freq: Hertz(8_000_000),
            mode: HseMode::Bypass,
        });

        // pll: phase-locked loop, crucial for dividing clock
        config.rcc.pll_src = PllSource::HSE;
        config.rcc.pll = Some(Pll {
            prediv: PllPreDiv::DIV4,
            mul: PllMul::MUL216,
            divp: Some(PllPDiv::DIV2), // 8mhz / 4 * 216 / 2 = 216Mhz
            // per section 5.2 of RM0410: the 48MHz clock used for USB OTG FS is derived from main PLL VCO
            divq: Some(PllQDiv::DIV9), // 8mhz / 4 * 216 / 9 = 48Mhz
            divr: None,
        });
        config.rcc.ahb_pre = AHBPrescaler::DIV1;
        config.rcc.apb1_pre = APBPrescaler::DIV4;
        config.rcc.apb2_pre = APBPrescaler::DIV2;
        config.rcc.sys = Sysclk::PLL1_P;
        config.rcc.mux.clk48sel = mux::Clk48sel::PLL1_Q;
    }
    let p = embassy_stm32::init(config);

    let settings = Settings::default();

    // the remote device watches this pin to learn that a controller is attached
    let detect = Output::new(p.PG0, Level::High, Speed::Low);

    let button = ExtiInput::new(p.PC13, p.EXTI13, Pull::None);
    unwrap!(spawner.spawn(select_pressure_curve(
        button,
        PRESSURE_CURVE_SYNC.sender()
    )));

    let red_led = Output::new(p.PB14, Level::Low, Speed::Low);
    let display_receiver = unwrap!(PRESSURE_CURVE_SYNC.receiver());
    unwrap!(spawner.spawn(display_pressure_curve(red_led, display_receiver)));

    // Create the driver, from the HAL.
    static ENDPOINT_OUT_BUFFER: StaticCell<[u8; 256]> = StaticCell::new();
    let mut usb_config = embassy_stm32::usb::Config::default();

    // Per section 6.10 of the Nucleo board manual (UM1974), CN13 (the USB port) cannot power the board, so the
    // device is self-powered and must detect VBUS.
    usb_config.vbus_detection = true;

    let driver = usb::Driver::new_fs(
        p.USB_OTG_FS,
        Irqs,
        p.PA12,
        p.PA11,
        ENDPOINT_OUT_BUFFER.init([0; 256]),
        usb_config,
    );

    // per https://pid.codes, FOSS projects can apply to be listed under the vendor ID owned by InterBiometrics
    let vendor_id = 0x1209;
    let product_id = 0xBA27;

    let mut usb_config = embassy_usb::Config::new(vendor_id, product_id);
    usb_config.manufacturer = Some("Pawpaw Works");
    usb_config.product = Some("Bartleby");
    usb_config.self_powered = true;
    usb_config.max_power = 0;

    static CONFIG_DESCRIPTOR: StaticCell<[u8; 256]> = StaticCell::new();
    static BOS_DESCRIPTOR: StaticCell<[u8; 256]> = StaticCell::new();
    static CONTROL_BUFFER: StaticCell<[u8; 64]> = StaticCell::new();

    let mut builder = Builder::new(
        driver,
        usb_config,
        CONFIG_DESCRIPTOR.init([0; 256]),
        BOS_DESCRIPTOR.init([0; 256]),
        &mut [], // no msos descriptors
        CONTROL_BUFFER.init([0; 64]),
    );
    let class = MidiClass::new(&mut builder, 1, 1, 64);
    let usb = builder.build();

    unwrap!(spawner.spawn(usb_task(usb)));
    unwrap!(spawner.spawn(usb_midi_task(class, USB_MIDI.receiver())));

    // 8-N-1 is the UART default; only the rate differs
    let mut uart_config = usart::Config::default();
    uart_config.baudrate = BAUD_RATE;

    static UART_TX_BUFFER: StaticCell<[u8; 256]> = StaticCell::new();
    static UART_RX_BUFFER: StaticCell<[u8; 256]> = StaticCell::new();
    let uart = unwrap!(BufferedUart::new(
        p.USART2,
        p.PD6,
        p.PD5,
        UART_TX_BUFFER.init([0; 256]),
        UART_RX_BUFFER.init([0; 256]),
        Irqs,
        uart_config,
    ));
    let link = UartLink::new(uart, USB_MIDI.sender());

    let output = |pin: Peri<'static, AnyPin>| Output::new(pin, Level::Low, Speed::Low);
    let keys_a = Mux::new(
        p.PA3.degrade_adc(),
        [output(p.PE2.into()), output(p.PE4.into()), output(p.PE5.into()), output(p.PE6.into())],
    );
    let keys_b = Mux::new(
        p.PC0.degrade_adc(),
        [output(p.PE7.into()), output(p.PE8.into()), output(p.PE9.into()), output(p.PE10.into())],
    );
    let selector = [
        output(p.PE12.into()),
        output(p.PE13.into()),
        output(p.PE14.into()),
        output(p.PE15.into()),
    ];
    let controls = Mux::new(
        p.PC3.degrade_adc(),
        [
            output(p.PF12.into()),
            output(p.PF13.into()),
            output(p.PF14.into()),
            output(p.PF15.into()),
        ],
    );
    let panel = Panel::new(
        Adc::new(p.ADC1),
        keys_a,
        keys_b,
        selector,
        controls,
        Input::new(p.PG2, Pull::Up),
        Input::new(p.PG3, Pull::Up),
        settings.octave_limit,
    );

    let controller = Bartleby::new(link, panel, settings, Instant::now());
    let curve_receiver = unwrap!(PRESSURE_CURVE_SYNC.receiver());
    unwrap!(spawner.spawn(control_loop(controller, detect, curve_receiver, settings)));
}

/// Runs the controller once per loop period for as long as the board is powered.
///
/// Only resource exhaustion ends the loop. In that case the notes are silenced, the detect pin is released so the
/// remote device stops expecting a controller, and the board halts.
#[embassy_executor::task]
async fn control_loop(
    mut controller: Controller,
    mut detect: Output<'static>,
    mut pressure_curve: PressureCurveReceiver<'static>,
    settings: Settings,
) -> ! {
    let fault = match controller.start(Instant::now()) {
        Ok(()) => run(&mut controller, &mut pressure_curve, settings).await,
        Err(e) => e,
    };

    error!("Control loop halted: {}", fault);
    controller.cleanup(Instant::now());
    detect.set_low();
    panic!("Unrecoverable fault: {}", fault)
}

async fn run(
    controller: &mut Controller,
    pressure_curve: &mut PressureCurveReceiver<'static>,
    settings: Settings,
) -> Error {
    let mut ticker = Ticker::every(settings.loop_period);
    loop {
        if let Some(curve) = pressure_curve.try_changed() {
            info!("Pressure curve: {}", curve);
            controller.set_pressure_curve(curve);
        }

        if let Err(e) = controller.tick(Instant::now()) {
            return e;
        }
        ticker.next().await;
    }
}

/// Handles button presses, cycling through the [`ResponseCurve`] options for key pressure.
#[embassy_executor::task]
async fn select_pressure_curve(
    mut button: ExtiInput<'static>,
    pressure_curve: PressureCurveSender<'static>,
) -> ! {
    loop {
        button.wait_for_rising_edge().await;

        let curve = pressure_curve
            .try_get()
            .unwrap_or_default()
            .cycle();
        pressure_curve.send(curve);
    }
}

/// Blinks the selected [`ResponseCurve`].
///
/// Each cycle is divided in half. The LED remains dark for one half. For the other, the LED lights up N times
/// (where N is one more than the index of the selected curve).
#[embassy_executor::task]
async fn display_pressure_curve(
    mut led: Output<'static>,
    mut pressure_curve: PressureCurveReceiver<'static>,
) -> ! {
    const BLINK_PERIOD_US: u64 = 1_000_000;

    loop {
        led.set_low();
        Timer::after_micros(BLINK_PERIOD_US).await;

        // since the index starts with 0, 1 is added or else the LED wouldn't blink at all for the linear curve
        let blink_cnt = { pressure_curve.get().await as u8 }.saturating_add(1);
        // mult by two to account for the "off" periods, sub 1 so the LED always starts and ends lit
        let animation_frames = blink_cnt * 2 - 1;
        let mut counter = animation_frames;
        while counter > 0 {
            led.toggle();
            Timer::after_micros(BLINK_PERIOD_US / u64::from(animation_frames)).await;
            counter -= 1;
        }
    }
}

#[embassy_executor::task]
async fn usb_task(mut usb: UsbDevice<'static, UsbDriver>) -> ! {
    usb.run().await
}

/// Forwards mirrored MIDI to the USB host while one is connected.
#[embassy_executor::task]
async fn usb_midi_task(
    mut class: MidiClass<'static, UsbDriver>,
    packets: UsbMidiReceiver<'static>,
) -> ! {
    loop {
        class.wait_connection().await;
        info!("USB connected");
        let _ = forward_midi(&mut class, &packets).await;
        info!("USB disconnected");
    }
}

#[doc(hidden)]
struct Disconnected {}

impl From<EndpointError> for Disconnected {
    fn from(val: EndpointError) -> Self {
        match val {
            EndpointError::BufferOverflow => panic!("Buffer overflow"),
            EndpointError::Disabled => Disconnected {},
        }
    }
}

async fn forward_midi(
    class: &mut MidiClass<'static, UsbDriver>,
    packets: &UsbMidiReceiver<'static>,
) -> Result<(), Disconnected> {
    // anything queued while no host was listening is stale
    while packets.try_receive().is_ok() {}
    loop {
        let packet = packets.receive().await;
        class.write_packet(&packet).await?;
    }
}
