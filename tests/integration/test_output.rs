// Copyright © 2024 Pathway

#![allow(clippy::disallowed_methods)]

use std::cell::RefCell;
use std::fs;
use std::rc::Rc;

use super::helpers::{key, path, row, row_at, run_graph, static_table, Captured};

use pathway_core::connectors::data_format::{DsvFormatter, DsvSettings, JsonLinesFormatter};
use pathway_core::connectors::data_storage::{FileWriter, MemoryWriter};
use pathway_core::connectors::DataRow;
use pathway_core::engine::{SubscribeCallbacksBuilder, Value};

fn names() -> Vec<String> {
    vec!["n".to_string(), "s".to_string()]
}

fn products() -> Vec<DataRow> {
    vec![
        row(1, vec![Value::Int(1), Value::from("a")]),
        row(2, vec![Value::Int(2), Value::from("b")]),
        row_at(1, vec![Value::Int(1), Value::from("a")], 2, -1),
    ]
}

#[test]
fn test_json_lines_output() -> eyre::Result<()> {
    let writer = MemoryWriter::new();
    let sink = writer.clone();
    run_graph(1, move |graph| {
        let table = static_table(graph, products())?;
        graph.output_table(
            Box::new(sink.clone()),
            Box::new(JsonLinesFormatter::new(names())),
            table,
            vec![path(&[0]), path(&[1])],
            false,
        )?;
        Ok(Captured::default())
    })?;
    let lines = writer.lines();
    let mut first_time = lines[..2].to_vec();
    first_time.sort();
    assert_eq!(
        first_time,
        vec![
            r#"{"n":1,"s":"a","diff":1,"time":0}"#,
            r#"{"n":2,"s":"b","diff":1,"time":0}"#,
        ]
    );
    assert_eq!(lines[2], r#"{"n":1,"s":"a","diff":-1,"time":2}"#);
    Ok(())
}

#[test]
fn test_csv_output_to_file() -> eyre::Result<()> {
    let directory = tempfile::tempdir()?;
    let output_path = directory.path().join("output.csv");
    let file_path = output_path.clone();
    run_graph(1, move |graph| {
        let table = static_table(graph, products())?;
        graph.output_table(
            Box::new(FileWriter::create(&file_path)?),
            Box::new(DsvFormatter::new(DsvSettings::new(names(), ','))),
            table,
            vec![path(&[0]), path(&[1])],
            false,
        )?;
        Ok(Captured::default())
    })?;
    let contents = fs::read_to_string(&output_path)?;
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], r#""n","s","time","diff""#);
    assert!(lines[1..3].contains(&r#""1","a","0","1""#));
    assert!(lines[1..3].contains(&r#""2","b","0","1""#));
    assert_eq!(lines[3], r#""1","a","2","-1""#);
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Data(i64, u64, isize),
    TimeEnd(u64),
    End,
}

#[test]
fn test_subscribe_callbacks_order() -> eyre::Result<()> {
    let results = pathway_core::engine::run_with_new_dataflow_graph(
        |graph| {
            let events: Rc<RefCell<Vec<Event>>> = Rc::default();
            let table = static_table(
                graph,
                vec![
                    row(1, vec![Value::Int(10)]),
                    row_at(1, vec![Value::Int(10)], 2, -1),
                    row_at(1, vec![Value::Int(11)], 2, 1),
                ],
            )?;
            let (on_data, on_time_end, on_end) = (events.clone(), events.clone(), events.clone());
            graph.subscribe_table(
                table,
                vec![path(&[0])],
                SubscribeCallbacksBuilder::new()
                    .on_data(Box::new(move |row_key, values, time, diff| {
                        assert_eq!(row_key, key(1));
                        on_data
                            .borrow_mut()
                            .push(Event::Data(values[0].as_int()?, time, diff));
                        Ok(())
                    }))
                    .on_time_end(Box::new(move |time| {
                        on_time_end.borrow_mut().push(Event::TimeEnd(time));
                        Ok(())
                    }))
                    .on_end(Box::new(move || {
                        on_end.borrow_mut().push(Event::End);
                        Ok(())
                    }))
                    .build(),
                false,
            )?;
            Ok(events)
        },
        |events: Rc<RefCell<Vec<Event>>>| events.take(),
        pathway_core::engine::Config::with_threads(1)?,
        pathway_core::engine::MonitoringLevel::None,
        None,
    )?;
    assert_eq!(
        results,
        vec![vec![
            Event::Data(10, 0, 1),
            Event::TimeEnd(0),
            Event::Data(10, 2, -1),
            Event::Data(11, 2, 1),
            Event::TimeEnd(2),
            Event::End,
        ]]
    );
    Ok(())
}
