//! Desktop front-end.
//!
//! The machine runs on its own worker thread; this binary owns the window,
//! blits the stable framebuffer at the host refresh cadence, forwards
//! keyboard and mouse input, and feeds the audio ring.

#![allow(clippy::cast_possible_truncation)]

mod audio;
mod keymap;
mod settings;

use std::path::PathBuf;
use std::process;
use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};

use format_adf::Adf;
use format_rom::RomFile;
use machine_a500::amiga::{Amiga, InputEvent, InputQueue};
use machine_a500::config::AmigaConfig;
use machine_a500::denise::pixels::{HPIXELS, VPIXELS};
use machine_a500::paula::audio::SAMPLE_RATE;
use machine_a500::{AmigaThread, ConfigOption, MsgType};
use pixels::{Pixels, SurfaceTexture};
use winit::application::ApplicationHandler;
use winit::event::{ElementState, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::PhysicalKey;
use winit::window::{Window, WindowAttributes, WindowId};

use audio::AudioOutput;
use settings::Settings;

const FRAME_DURATION: Duration = Duration::from_micros(20_000);

struct CliArgs {
    settings_path: Option<PathBuf>,
    rom_path: Option<PathBuf>,
    df0_path: Option<PathBuf>,
    warp: bool,
    scale: u32,
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = CliArgs {
        settings_path: None,
        rom_path: None,
        df0_path: None,
        warp: false,
        scale: 1,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--settings" => {
                i += 1;
                cli.settings_path = args.get(i).map(PathBuf::from);
            }
            "--rom" | "--kickstart" => {
                i += 1;
                cli.rom_path = args.get(i).map(PathBuf::from);
            }
            "--df0" | "--disk" => {
                i += 1;
                cli.df0_path = args.get(i).map(PathBuf::from);
            }
            "--warp" => cli.warp = true,
            "--scale" => {
                i += 1;
                if let Some(s) = args.get(i) {
                    cli.scale = s.parse().unwrap_or(1);
                }
            }
            "--help" | "-h" => {
                eprintln!("Usage: a500-runner [OPTIONS]");
                eprintln!();
                eprintln!("Options:");
                eprintln!("  --settings <file>  JSON settings file");
                eprintln!("  --rom <file>       Kickstart ROM image");
                eprintln!("  --df0 <file>       ADF disk image for df0");
                eprintln!("  --warp             Start in warp mode");
                eprintln!("  --scale <n>        Window scale factor [default: 1]");
                process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                process::exit(1);
            }
        }
        i += 1;
    }
    cli
}

fn build_machine(cli: &CliArgs, settings: &Settings) -> Result<Amiga, String> {
    let mut config = AmigaConfig::a500();
    if let Some(kb) = settings.chip_ram_kb {
        config.chip_ram_kb = kb;
    }
    if let Some(kb) = settings.slow_ram_kb {
        config.slow_ram_kb = kb;
    }
    if let Some(kb) = settings.fast_ram_kb {
        config.fast_ram_kb = kb;
    }

    let mut amiga = Amiga::new(config);
    if let Some(accuracy) = settings.blitter_accuracy {
        if !amiga.configure(ConfigOption::BlitterAccuracy, accuracy) {
            return Err(format!("bad blitter accuracy: {accuracy}"));
        }
    }
    if let Some(speed) = settings.drive_speed {
        if !amiga.configure(ConfigOption::DriveSpeed, speed) {
            return Err(format!("bad drive speed: {speed}"));
        }
    }

    let rom_path = cli.rom_path.clone().or_else(|| settings.rom.clone());
    if let Some(path) = rom_path {
        let bytes =
            std::fs::read(&path).map_err(|e| format!("cannot read {}: {e}", path.display()))?;
        let rom = RomFile::from_bytes(bytes).map_err(|e| format!("{}: {e}", path.display()))?;
        amiga.load_rom(rom);
    }

    for (nr, path) in [
        (0, cli.df0_path.clone().or_else(|| settings.df0.clone())),
        (1, settings.df1.clone()),
    ] {
        let Some(path) = path else { continue };
        let bytes =
            std::fs::read(&path).map_err(|e| format!("cannot read {}: {e}", path.display()))?;
        let adf = Adf::from_bytes(bytes).map_err(|e| format!("{}: {e}", path.display()))?;
        amiga.insert_disk(nr, adf);
    }

    Ok(amiga)
}

struct App {
    thread: AmigaThread,
    input: InputQueue,
    audio_rx: Receiver<Vec<f32>>,
    audio: Option<AudioOutput>,
    stable: std::sync::Arc<std::sync::Mutex<machine_a500::denise::pixels::StableBuffers>>,
    window: Option<&'static Window>,
    pixels: Option<Pixels<'static>>,
    scale: u32,
    last_frame: Instant,
}

impl App {
    fn new(mut amiga: Amiga, scale: u32) -> Self {
        let input = amiga.input_queue();
        let audio_rx = amiga.audio_receiver();
        let stable = amiga.bus.denise.pixel_engine.stable_handle();
        let mut thread = AmigaThread::new(amiga);
        thread.run();
        Self {
            thread,
            input,
            audio_rx,
            audio: AudioOutput::new(SAMPLE_RATE),
            stable,
            window: None,
            pixels: None,
            scale,
            last_frame: Instant::now(),
        }
    }

    fn blit_stable_frame(&mut self) {
        let Some(pixels) = self.pixels.as_mut() else {
            return;
        };
        let frame = pixels.frame_mut();
        {
            let stable = match self.stable.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            for (i, &rgba) in stable.long.data.iter().enumerate() {
                let offset = i * 4;
                frame[offset] = (rgba >> 16) as u8;
                frame[offset + 1] = (rgba >> 8) as u8;
                frame[offset + 2] = rgba as u8;
                frame[offset + 3] = 0xFF;
            }
        }
        if let Some(window) = self.window {
            if pixels.render().is_err() {
                eprintln!("render failed");
            }
            window.request_redraw();
        }
    }

    fn pump_audio(&mut self) {
        while let Ok(samples) = self.audio_rx.try_recv() {
            if let Some(audio) = self.audio.as_mut() {
                audio.push(&samples);
            }
        }
    }

    fn drain_messages(&self) {
        let msgs = self.thread.message_queue();
        while let Some(message) = msgs.get() {
            match message.msg {
                MsgType::DriveMotorOn | MsgType::DriveMotorOff | MsgType::BreakpointReached => {
                    eprintln!("[amiga] {:?} ({})", message.msg, message.data);
                }
                _ => {}
            }
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        let size = winit::dpi::LogicalSize::new(
            HPIXELS as u32 * self.scale / 2,
            VPIXELS as u32 * self.scale,
        );
        let attrs = WindowAttributes::default()
            .with_title("Amiga 500")
            .with_inner_size(size)
            .with_resizable(false);
        match event_loop.create_window(attrs) {
            Ok(window) => {
                let window: &'static Window = Box::leak(Box::new(window));
                let inner = window.inner_size();
                let surface = SurfaceTexture::new(inner.width, inner.height, window);
                match Pixels::new(HPIXELS as u32, VPIXELS as u32, surface) {
                    Ok(pixels) => self.pixels = Some(pixels),
                    Err(e) => {
                        eprintln!("cannot create surface: {e}");
                        event_loop.exit();
                    }
                }
                self.window = Some(window);
                window.request_redraw();
            }
            Err(e) => {
                eprintln!("cannot create window: {e}");
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                self.thread.pause();
                event_loop.exit();
            }
            WindowEvent::KeyboardInput { event, .. } => {
                if event.repeat {
                    return;
                }
                if let PhysicalKey::Code(code) = event.physical_key {
                    if let Some(amiga_code) = keymap::amiga_keycode(code) {
                        self.input.push(InputEvent::Key {
                            code: amiga_code,
                            pressed: event.state == ElementState::Pressed,
                        });
                    }
                }
            }
            WindowEvent::MouseInput { state, .. } => {
                self.input.push(InputEvent::MouseButton {
                    port: 0,
                    pressed: state == ElementState::Pressed,
                });
            }
            WindowEvent::RedrawRequested => {
                if self.last_frame.elapsed() >= FRAME_DURATION {
                    self.last_frame = Instant::now();
                    self.pump_audio();
                    self.drain_messages();
                    self.blit_stable_frame();
                } else if let Some(window) = self.window {
                    window.request_redraw();
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = self.window {
            window.request_redraw();
        }
    }
}

fn main() {
    let cli = parse_args();
    let settings = match cli.settings_path.as_deref() {
        Some(path) => match Settings::load(path) {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("{e}");
                process::exit(1);
            }
        },
        None => Settings::default(),
    };

    let mut amiga = match build_machine(&cli, &settings) {
        Ok(amiga) => amiga,
        Err(e) => {
            eprintln!("{e}");
            process::exit(1);
        }
    };

    if !amiga.power_on() {
        eprintln!("cannot power on: check that a ROM is loaded");
        process::exit(1);
    }
    amiga.set_warp(cli.warp || settings.warp_boot);

    let scale = if cli.scale > 0 { cli.scale } else { 1 };
    let event_loop = match EventLoop::new() {
        Ok(event_loop) => event_loop,
        Err(e) => {
            eprintln!("cannot create event loop: {e}");
            process::exit(1);
        }
    };
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new(amiga, scale.max(settings.scale.unwrap_or(1)));
    if let Err(e) = event_loop.run_app(&mut app) {
        eprintln!("event loop error: {e}");
        process::exit(1);
    }
}
