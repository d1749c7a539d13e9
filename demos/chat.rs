//! bevy chat window with a side panel for conversation analysis.
//! - left column: latest analysis summary + predicted next response.
//! - right column: full conversation and the prompt line.
//! - enter sends, escape resets the session.
//!
//! env:
//!   GOOGLE_API_KEY   (or LLM_API_KEY)
//!   LLM_BACKEND      (default google)
//!   LLM_MODEL        (default gemini-1.5-pro)
//!   see `ChatConfig::from_env` for retry/analysis knobs.

use bevy::input::keyboard::{KeyCode, KeyboardInput};
use bevy::prelude::*;
use bevy_chat_analyst::{
    build_provider, reset_session, send_user_text, ChatAnalysisEvt, ChatAnalystPlugin,
    ChatCompletedEvt, ChatConfig, ChatResetEvt, ChatRetryEvt, ChatSession, ChatSettings,
    ChatStarted, Conversation, ConversationAnalysis, Providers, Role,
};

// ---------------------- ui tags ----------------------

#[derive(Component)]
struct HistoryText;
#[derive(Component)]
struct PromptText;
#[derive(Component)]
struct StatusText;
#[derive(Component)]
struct SummaryText;
#[derive(Component)]
struct PredictionText;

#[derive(Resource)]
struct Session(Entity);

#[derive(Resource, Default)]
struct PromptBuf(String);

// ---------------------- main ----------------------

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = ChatConfig::from_env()?;
    // logging isn't up until DefaultPlugins, so report straight to stderr
    if let Err(err) = cfg.require_api_key() {
        eprintln!("error: {err}");
        return Err(err.into());
    }
    let provider = build_provider(&cfg)?;
    let settings = ChatSettings::from_config(&cfg)?;

    App::new()
        .insert_resource(ClearColor(Color::srgb_u8(18, 18, 20)))
        .insert_resource(Providers::from_llm(provider))
        .insert_resource(settings)
        .insert_resource(PromptBuf::default())
        .add_plugins(DefaultPlugins)
        .add_plugins(ChatAnalystPlugin)
        .add_systems(Startup, setup)
        .add_systems(Update, (handle_text_input, refresh_prompt_text))
        // event readers should run after the plugin emits events
        .add_systems(
            Update,
            (on_started, on_retry, on_done, on_analysis, on_reset)
                .after(bevy_chat_analyst::ChatSet::Drain),
        )
        .run();
    Ok(())
}

// ---------------------- setup ui ----------------------

fn setup(mut commands: Commands) {
    commands.spawn(Camera2d);

    let session = commands.spawn(ChatSession::default()).id();
    commands.insert_resource(Session(session));

    let title = TextFont { font_size: 22.0, ..default() };
    let heading = TextFont { font_size: 16.0, ..default() };
    let body = TextFont { font_size: 14.0, ..default() };

    // root: [analysis 2/7 | conversation 5/7]
    commands
        .spawn((
            Node {
                width: Val::Percent(100.0),
                height: Val::Percent(100.0),
                flex_direction: FlexDirection::Column,
                row_gap: Val::Px(8.0),
                padding: UiRect::all(Val::Px(12.0)),
                ..default()
            },
            BackgroundColor(Color::NONE),
        ))
        .with_children(|p| {
            p.spawn((Text::new("SY-PI"), title.clone(), TextColor(Color::WHITE)));

            p.spawn((
                Node {
                    width: Val::Percent(100.0),
                    height: Val::Percent(100.0),
                    flex_direction: FlexDirection::Row,
                    column_gap: Val::Px(12.0),
                    ..default()
                },
                BackgroundColor(Color::NONE),
            ))
            .with_children(|row| {
                // --- analysis column ---
                row.spawn((
                    Node {
                        width: Val::Percent(28.0),
                        height: Val::Percent(100.0),
                        flex_direction: FlexDirection::Column,
                        row_gap: Val::Px(6.0),
                        padding: UiRect::all(Val::Px(8.0)),
                        ..default()
                    },
                    BackgroundColor(Color::srgb(0.10, 0.10, 0.12)),
                ))
                .with_children(|c| {
                    c.spawn((Text::new("Conversation Analysis"), heading.clone(), TextColor(Color::WHITE)));
                    c.spawn((Text::new(""), body.clone(), TextColor(Color::srgb_u8(200, 200, 200)), SummaryText));
                    c.spawn((Text::new("Predicted Next Response"), heading.clone(), TextColor(Color::WHITE)));
                    c.spawn((Text::new(""), body.clone(), TextColor(Color::srgb_u8(200, 200, 200)), PredictionText));
                });

                // --- conversation column ---
                row.spawn((
                    Node {
                        width: Val::Percent(72.0),
                        height: Val::Percent(100.0),
                        flex_direction: FlexDirection::Column,
                        row_gap: Val::Px(8.0),
                        padding: UiRect::axes(Val::Px(8.0), Val::Px(12.0)),
                        ..default()
                    },
                    BackgroundColor(Color::NONE),
                ))
                .with_children(|c| {
                    c.spawn((Text::new(""), body.clone(), TextColor(Color::WHITE), HistoryText));
                    c.spawn((Text::new(""), body.clone(), TextColor(Color::srgb_u8(230, 180, 80)), StatusText));
                    c.spawn((Text::new("> "), body.clone(), TextColor(Color::WHITE), PromptText));
                });
            });
        });
}

// ---------------------- input ----------------------

fn handle_text_input(
    mut commands: Commands,
    mut ev_kbd: EventReader<KeyboardInput>,
    keys: Res<ButtonInput<KeyCode>>,
    mut prompt: ResMut<PromptBuf>,
    session: Res<Session>,
) {
    for ev in ev_kbd.read() {
        if ev.state.is_pressed() {
            if let Some(txt) = &ev.text {
                let s = txt.replace(['\r', '\n'], "");
                prompt.0.push_str(&s);
            }
        }
    }

    if keys.just_pressed(KeyCode::Backspace) {
        prompt.0.pop();
    }

    if keys.just_pressed(KeyCode::Escape) {
        prompt.0.clear();
        reset_session(&mut commands, session.0);
    }

    if keys.just_pressed(KeyCode::Enter) && !prompt.0.trim().is_empty() {
        let msg = std::mem::take(&mut prompt.0);
        send_user_text(&mut commands, session.0, msg.trim());
    }
}

fn refresh_prompt_text(prompt: Res<PromptBuf>, mut q: Query<&mut Text, With<PromptText>>) {
    if prompt.is_changed() {
        if let Ok(mut t) = q.single_mut() {
            t.0 = format!("> {} |", prompt.0);
        }
    }
}

// ---------------------- chat events ----------------------

fn render_history(convo: &Conversation) -> String {
    let mut out = String::new();
    for turn in convo.0.turns() {
        let who = match turn.role() {
            Role::User => "you",
            Role::Bot => "bot",
        };
        out.push_str(who);
        out.push_str(": ");
        out.push_str(turn.text());
        out.push('\n');
    }
    out
}

type StatusQuery<'w, 's> = Query<'w, 's, &'static mut Text, (With<StatusText>, Without<HistoryText>)>;

fn on_started(
    mut ev: EventReader<ChatStarted>,
    q_convo: Query<&Conversation>,
    mut q_hist: Query<&mut Text, With<HistoryText>>,
    mut q_status: StatusQuery,
) {
    for ChatStarted { entity } in ev.read() {
        // show the user line right away
        if let (Ok(convo), Ok(mut h)) = (q_convo.get(*entity), q_hist.single_mut()) {
            h.0 = render_history(convo);
        }
        if let Ok(mut s) = q_status.single_mut() {
            s.0 = "thinking...".to_string();
        }
    }
}

fn on_retry(mut ev: EventReader<ChatRetryEvt>, mut q_status: StatusQuery) {
    for ChatRetryEvt { notice, .. } in ev.read() {
        if let Ok(mut s) = q_status.single_mut() {
            s.0 = notice.to_string();
        }
    }
}

fn on_done(
    mut ev: EventReader<ChatCompletedEvt>,
    q_convo: Query<&Conversation>,
    mut q_hist: Query<&mut Text, With<HistoryText>>,
    mut q_status: StatusQuery,
) {
    for ChatCompletedEvt { entity, outcome, .. } in ev.read() {
        if !outcome.is_reply() {
            warn!(target: "sypi", "reply failed: {}", outcome);
        }
        if let (Ok(convo), Ok(mut h)) = (q_convo.get(*entity), q_hist.single_mut()) {
            h.0 = render_history(convo);
        }
        if let Ok(mut s) = q_status.single_mut() {
            s.0.clear();
        }
    }
}

fn on_analysis(
    mut ev: EventReader<ChatAnalysisEvt>,
    q_analysis: Query<&ConversationAnalysis>,
    mut sets: ParamSet<(
        Query<&mut Text, With<SummaryText>>,
        Query<&mut Text, With<PredictionText>>,
    )>,
) {
    for ChatAnalysisEvt { entity, .. } in ev.read() {
        let Ok(ConversationAnalysis(Some(analysis))) = q_analysis.get(*entity) else {
            continue;
        };
        if let Ok(mut t) = sets.p0().single_mut() {
            t.0 = analysis.summary.clone();
        }
        if let Ok(mut t) = sets.p1().single_mut() {
            t.0 = analysis.prediction_text();
        }
    }
}

fn on_reset(
    mut ev: EventReader<ChatResetEvt>,
    mut sets: ParamSet<(
        Query<&mut Text, With<HistoryText>>,
        Query<&mut Text, With<StatusText>>,
        Query<&mut Text, With<SummaryText>>,
        Query<&mut Text, With<PredictionText>>,
    )>,
) {
    if ev.read().count() == 0 {
        return;
    }
    info!(target: "sypi", "session reset");
    if let Ok(mut t) = sets.p0().single_mut() {
        t.0.clear();
    }
    if let Ok(mut t) = sets.p1().single_mut() {
        t.0.clear();
    }
    if let Ok(mut t) = sets.p2().single_mut() {
        t.0.clear();
    }
    if let Ok(mut t) = sets.p3().single_mut() {
        t.0.clear();
    }
}
