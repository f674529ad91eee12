//! Gnomon follower node firmware
//!
//! One RP2040 per clock unit: two stepper hands, a shared half-duplex
//! RS-485 bus to the coordinator, and the barrier chain used during
//! discovery. All real work happens in two cooperative tasks - the bus task
//! (protocol + discovery) and the motion task (homing + execution); they
//! communicate only through the statics in [`channels`].

#![no_std]
#![no_main]

use defmt::*;
use embassy_executor::Spawner;
use embassy_rp::bind_interrupts;
use embassy_rp::gpio::{Input, Level, Output, Pull};
use embassy_rp::peripherals::UART0;
use embassy_rp::uart::{BufferedInterruptHandler, Config as UartConfig, Uart};
use static_cell::StaticCell;
use {defmt_rtt as _, panic_probe as _};

use gnomon_core::ticks::RING;
use gnomon_drivers::stepper::RampedStepper;

mod board;
mod channels;
mod tasks;

use tasks::{bus_task, motion_task, DirectionGate};

bind_interrupts!(struct Irqs {
    UART0_IRQ => BufferedInterruptHandler<UART0>;
});

// UART buffers must live forever
static TX_BUF: StaticCell<[u8; 256]> = StaticCell::new();
static RX_BUF: StaticCell<[u8; 256]> = StaticCell::new();

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("gnomon follower starting");

    let p = embassy_rp::init(Default::default());

    // RS-485 link to the coordinator
    let uart_config = {
        let mut cfg = UartConfig::default();
        cfg.baudrate = board::BAUD_RATE;
        cfg
    };
    let tx_buf = TX_BUF.init([0u8; 256]);
    let rx_buf = RX_BUF.init([0u8; 256]);
    let uart = Uart::new_blocking(p.UART0, p.PIN_0, p.PIN_1, uart_config);
    let uart = uart.into_buffered(Irqs, tx_buf, rx_buf);
    let (tx, rx) = uart.split();

    let gate = DirectionGate::new(
        Output::new(p.PIN_2, Level::Low),
        Output::new(p.PIN_3, Level::Low),
    );

    // Barrier chain: drive downstream, sense upstream
    let barrier_out = Output::new(p.PIN_4, Level::High);
    let barrier_in = Input::new(p.PIN_5, Pull::Down);

    // Two hands; magnet sensors are active low with pull-ups
    let motor0 = RampedStepper::new(
        Output::new(p.PIN_6, Level::Low),
        Output::new(p.PIN_7, Level::Low),
        Input::new(p.PIN_26, Pull::Up),
        RING,
    );
    let motor1 = RampedStepper::new(
        Output::new(p.PIN_8, Level::Low),
        Output::new(p.PIN_9, Level::Low),
        Input::new(p.PIN_27, Pull::Up),
        RING,
    );

    info!("peripherals initialized, {} ticks per revolution", RING.size());

    spawner.must_spawn(bus_task(rx, tx, gate, barrier_out, barrier_in));
    spawner.must_spawn(motion_task(motor0, motor1));
}
