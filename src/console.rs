//! Terminal front end: typed commands act as the buttons, and a status line
//! reports the player.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::player::io::{ButtonSource, Buttons};
use crate::player::state::{DriveInfo, DriveStatus, PlayerState};
use crate::player::time::frame_to_hmsf;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Play,
    Next,
    Prev,
    /// Seek by this many seconds.
    Forward(u32),
    Backward(u32),
    VolumeUp,
    VolumeDown,
    Volume(u8),
    Eject,
}

pub const HELP: &str = "commands: play, next, prev, ff [secs], rew [secs], up, down, vol <0-100>, eject";

pub fn parse_command(line: &str) -> Option<Command> {
    let mut words = line.split_whitespace();
    let verb = words.next()?.to_ascii_lowercase();
    let arg = words.next();
    let seconds = || arg.map_or(Some(10), |a| a.parse().ok());
    match verb.as_str() {
        "play" | "pause" | "p" => Some(Command::Play),
        "next" | "n" => Some(Command::Next),
        "prev" | "b" => Some(Command::Prev),
        "ff" => seconds().map(Command::Forward),
        "rew" => seconds().map(Command::Backward),
        "up" | "+" => Some(Command::VolumeUp),
        "down" | "-" => Some(Command::VolumeDown),
        "vol" => arg?.parse().ok().map(Command::Volume),
        "eject" | "e" => Some(Command::Eject),
        _ => None,
    }
}

/// [`ButtonSource`] fed by commands typed on stdin.
///
/// Each command becomes a short run of button frames followed by a release, so the
/// Playback loop sees the same edges and holds a physical button would produce.
pub struct ConsoleButtons {
    commands: mpsc::Receiver<Command>,
    frames: VecDeque<Buttons>,
    volume: Option<u8>,
    long_press: u32,
}

impl ConsoleButtons {
    pub fn new(commands: mpsc::Receiver<Command>, long_press: u32) -> Self {
        Self {
            commands,
            frames: VecDeque::new(),
            volume: None,
            long_press,
        }
    }

    /// Reads stdin on a separate task.
    pub fn stdin(long_press: u32) -> Self {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(read_commands(tx));
        Self::new(rx, long_press)
    }

    fn queue(&mut self, command: Command) {
        let press = |held: Buttons, ticks: u32| std::iter::repeat_n(held, ticks as usize);
        let frames: Vec<Buttons> = match command {
            Command::Volume(volume) => {
                self.volume = Some(volume);
                return;
            }
            Command::Play => press(button(|b| b.play = true), 1).collect(),
            Command::Next => press(button(|b| b.next = true), 1).collect(),
            Command::Prev => press(button(|b| b.prev = true), 1).collect(),
            Command::VolumeUp => press(button(|b| b.volume_up = true), 1).collect(),
            Command::VolumeDown => press(button(|b| b.volume_down = true), 1).collect(),
            Command::Eject => press(button(|b| b.eject = true), 1).collect(),
            // the first seek step lands on the long-press tick itself
            Command::Forward(secs) => press(button(|b| b.next = true), self.long_press + secs.saturating_sub(1)).collect(),
            Command::Backward(secs) => press(button(|b| b.prev = true), self.long_press + secs.saturating_sub(1)).collect(),
        };
        self.frames.extend(frames);
        self.frames.push_back(Buttons::default());
    }
}

fn button(set: impl FnOnce(&mut Buttons)) -> Buttons {
    let mut buttons = Buttons::default();
    set(&mut buttons);
    buttons
}

impl ButtonSource for ConsoleButtons {
    fn poll(&mut self) -> Buttons {
        if self.frames.is_empty() {
            if let Ok(command) = self.commands.try_recv() {
                debug!(?command, "console");
                self.queue(command);
            }
        }
        self.frames.pop_front().unwrap_or_default()
    }

    fn volume_request(&mut self) -> Option<u8> {
        self.volume.take()
    }
}

async fn read_commands(tx: mpsc::Sender<Command>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{HELP}");
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match parse_command(&line) {
                Some(command) => {
                    if tx.send(command).await.is_err() {
                        return;
                    }
                }
                None => println!("{HELP}"),
            },
            Ok(None) => {
                debug!("stdin closed");
                return;
            }
            Err(e) => {
                warn!("reading stdin: {e}");
                return;
            }
        }
    }
}

/// One line describing the drive and what is playing.
pub fn status_line(drive: &DriveInfo, player: &PlayerState) -> String {
    let model = format!("{} {}", drive.vendor, drive.product);
    let model = match model.trim() {
        "" => "-",
        model => model,
    };
    let status = drive.status();
    let Some(track) = drive.track(player.track_index).filter(|_| status == DriveStatus::Ready) else {
        return format!("{model} | {}", status.label());
    };

    let transport = if player.fast_forward {
        "FF"
    } else if player.fast_backward {
        "REW"
    } else if player.playing {
        "PLAY"
    } else {
        "STOP"
    };
    let mut name = match &track.title {
        Some(title) => title.clone(),
        None => format!("Track {:02}", track.number),
    };
    if let Some(performer) = &track.performer {
        name = format!("{name} - {performer}");
    }
    let emphasis = if track.pre_emphasis { " PEM" } else { "" };
    format!(
        "{model} | {transport} {:02}/{:02} {name}{emphasis} | {} / {} | vol {}",
        player.track_index + 1,
        drive.tracks.len(),
        frame_to_hmsf(player.read_frame_count),
        frame_to_hmsf(track.duration),
        player.volume,
    )
}

/// Prints the status line whenever it changes, at most once per `every`.
pub async fn report(drive: watch::Receiver<DriveInfo>, player: watch::Receiver<PlayerState>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    let mut last = String::new();
    loop {
        interval.tick().await;
        let line = {
            let drive = drive.borrow();
            let player = player.borrow();
            status_line(&drive, &player)
        };
        if line != last {
            println!("{line}");
            last = line;
        }
    }
}
